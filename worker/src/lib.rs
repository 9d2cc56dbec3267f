//! The compute side of the cluster.
//!
//! A worker binds its compute endpoint, builds a training unit out of an environment
//! and a trainer, and hands both to a `Supervisor` that connects to the coordination
//! layer and drives training until the shared global step reaches its threshold.

pub mod checkpoint;
pub mod config;
pub mod endpoint;
pub mod environment;
pub mod error;
mod loop_;
pub mod session;
pub mod state;
pub mod summary;
pub mod supervisor;
pub mod trainer;
pub mod unit;
pub mod variables;

pub use checkpoint::{CheckpointTimer, Saver, Snapshot};
pub use config::WorkerConfig;
pub use endpoint::{ComputeEndpoint, ConcurrencyHints, query_status};
pub use environment::{EnvHandle, EnvKwargs, EnvMode, Environment, EnvironmentFactory};
pub use error::{Result, SupervisorErr, WorkerErr};
pub use loop_::TrainingLoop;
pub use session::{Readiness, Session};
pub use state::Phase;
pub use summary::SummaryWriter;
pub use supervisor::{Outcome, Supervisor};
pub use trainer::{Capabilities, ReplayMemory, Trainer, TrainerContext, TrainerFactory};
pub use unit::TrainingUnit;
pub use variables::{Init, Initializer, Initializers, VariableSet, VariableSpec};
