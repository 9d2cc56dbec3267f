pub mod cluster;
pub mod status;

pub use cluster::{ClusterSpec, PS_JOB, TopologyErr, WORKER_JOB};
pub use status::WorkerStatus;
