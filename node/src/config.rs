use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use comms::specs::ClusterSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use worker::{ConcurrencyHints, EnvKwargs, WorkerConfig};

use crate::NodeErr;

/// The configuration file shared by every node of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Role name to the ordered addresses of its tasks.
    pub cluster: ClusterSpec,
    pub log_dir: PathBuf,
    pub max_train_steps: u64,
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Makes diagnostic environments instead of production ones.
    #[serde(default)]
    pub test_mode: bool,
    /// Environment kwargs.
    #[serde(default)]
    pub env: EnvKwargs,
    /// Opaque policy configuration.
    #[serde(default)]
    pub policy: Value,
    /// Trainer kwargs.
    #[serde(default)]
    pub trainer: Value,
    /// Seconds between checkpoints, `0` disables checkpointing.
    #[serde(default = "defaults::save_model_secs")]
    pub save_model_secs: u64,
    #[serde(default = "defaults::recovery_wait_secs")]
    pub recovery_wait_secs: u64,
    #[serde(default = "defaults::connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default = "defaults::max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default = "defaults::intra_op_threads")]
    pub intra_op_threads: NonZeroUsize,
    #[serde(default = "defaults::inter_op_threads")]
    pub inter_op_threads: NonZeroUsize,
}

mod defaults {
    use std::num::NonZeroUsize;

    pub fn save_model_secs() -> u64 {
        300
    }

    pub fn recovery_wait_secs() -> u64 {
        1
    }

    pub fn connect_retry_ms() -> u64 {
        500
    }

    pub fn max_to_keep() -> usize {
        5
    }

    pub fn intra_op_threads() -> NonZeroUsize {
        NonZeroUsize::MIN
    }

    pub fn inter_op_threads() -> NonZeroUsize {
        NonZeroUsize::MIN.saturating_add(1)
    }
}

impl NodeConfig {
    /// Parses a configuration from JSON text.
    ///
    /// # Returns
    /// The configuration or `NodeErr::Config` if the text is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self, NodeErr> {
        serde_json::from_str(text).map_err(|e| NodeErr::Config(e.to_string()))
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Arguments
    /// * `path` - The path of the file.
    ///
    /// # Returns
    /// The configuration or `NodeErr::Config` if the file can't be read or parsed.
    pub fn load(path: &str) -> Result<Self, NodeErr> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeErr::Config(format!("cannot read '{path}': {e}")))?;

        Self::from_json(&content)
    }

    pub fn concurrency(&self) -> ConcurrencyHints {
        ConcurrencyHints::new(self.intra_op_threads, self.inter_op_threads)
    }

    /// The configuration of the worker with the given rank.
    pub fn worker_config(&self, rank: usize) -> WorkerConfig {
        let mut config = WorkerConfig::new(rank, &self.log_dir, self.max_train_steps);

        config.random_seed = self.random_seed;
        config.test_mode = self.test_mode;
        config.env_kwargs = self.env.clone();
        config.policy_config = self.policy.clone();
        config.trainer_kwargs = self.trainer.clone();
        config.save_interval = Duration::from_secs(self.save_model_secs);
        config.max_to_keep = self.max_to_keep;
        config.recovery_wait = Duration::from_secs(self.recovery_wait_secs);
        config.connect_retry = Duration::from_millis(self.connect_retry_ms);
        config.concurrency = self.concurrency();
        config
    }
}
