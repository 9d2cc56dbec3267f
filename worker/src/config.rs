use std::{path::PathBuf, time::Duration};

use serde_json::Value;

use crate::{ConcurrencyHints, EnvKwargs};

const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_RECOVERY_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_CONNECT_RETRY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_TO_KEEP: usize = 5;

/// Immutable execution bounds for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The task index of this worker inside the `worker` job, rank 0 is the chief.
    pub rank: usize,
    /// Root directory for checkpoints and summaries.
    pub log_dir: PathBuf,
    /// The global step at which training stops.
    pub max_train_steps: u64,
    pub random_seed: Option<u64>,
    /// Makes a diagnostic environment instead of the production one.
    pub test_mode: bool,
    pub env_kwargs: EnvKwargs,
    pub policy_config: Value,
    pub trainer_kwargs: Value,
    /// Time between checkpoints written by the chief, zero disables checkpointing.
    pub save_interval: Duration,
    /// Snapshots retained by the chief.
    pub max_to_keep: usize,
    /// Time between readiness checks while waiting for the shared state.
    pub recovery_wait: Duration,
    /// Time between attempts to reach a coordination endpoint.
    pub connect_retry: Duration,
    pub concurrency: ConcurrencyHints,
}

impl WorkerConfig {
    /// Creates a new worker configuration with default intervals.
    ///
    /// # Args
    /// * `rank` - The rank of this worker.
    /// * `log_dir` - Root directory for checkpoints and summaries.
    /// * `max_train_steps` - The global step at which training stops.
    ///
    /// # Returns
    /// A `WorkerConfig` instance.
    pub fn new(rank: usize, log_dir: impl Into<PathBuf>, max_train_steps: u64) -> Self {
        Self {
            rank,
            log_dir: log_dir.into(),
            max_train_steps,
            random_seed: None,
            test_mode: false,
            env_kwargs: EnvKwargs::default(),
            policy_config: Value::Null,
            trainer_kwargs: Value::Null,
            save_interval: DEFAULT_SAVE_INTERVAL,
            max_to_keep: DEFAULT_MAX_TO_KEEP,
            recovery_wait: DEFAULT_RECOVERY_WAIT,
            connect_retry: DEFAULT_CONNECT_RETRY,
            concurrency: ConcurrencyHints::default(),
        }
    }

    pub fn is_chief(&self) -> bool {
        self.rank == 0
    }

    /// Where the chief keeps its checkpoints.
    pub fn train_dir(&self) -> PathBuf {
        self.log_dir.join("train")
    }

    /// The name this worker logs under.
    pub fn log_name(&self) -> String {
        format!("worker_{}", self.rank)
    }
}
