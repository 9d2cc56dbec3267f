//! Turns a role name and a rank into a running cluster process.
//!
//! A `ps` process serves as a coordination endpoint until it is torn down, a `worker`
//! process binds its compute endpoint, builds a training unit and supervises it until
//! the shared global step reaches the configured threshold.

pub mod config;
pub mod demo;
pub mod error;
pub mod launch;
pub mod role;

pub use config::NodeConfig;
pub use error::NodeErr;
pub use launch::{launch, serve};
pub use role::{ExecutionPath, Role, resolve};
