use serde::{Deserialize, Serialize};

/// What a compute endpoint reports when asked for its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub rank: usize,
    /// Lifecycle phase name, e.g. `running`.
    pub phase: String,
    /// The last global step this rank observed.
    pub global_step: u64,
}

impl WorkerStatus {
    /// Creates the status of a rank that did not start its lifecycle yet.
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            phase: "uninitialized".into(),
            global_step: 0,
        }
    }
}
