//! The coordination endpoint of the cluster.
//!
//! A parameter server hosts the global variables, the canonical global step, the shared
//! stop flag and the first-time initialization election. It does no training work, it
//! only serves the sessions opened by worker ranks.

mod error;
mod service;
pub mod storage;


pub use error::ServerErr;
pub use service::{ParameterServer, serve};
pub use storage::VariableStore;
