use serde_json::Value;

use crate::{ConcurrencyHints, EnvHandle, Session, SummaryWriter, VariableSpec};

/// Optional features a trainer declares when it's built, checked once by the lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    replay_buffer: bool,
}

impl Capabilities {
    /// A trainer without optional features.
    pub const NONE: Self = Self {
        replay_buffer: false,
    };

    /// A trainer that owns a replay memory which must be filled before training.
    pub fn with_replay_buffer() -> Self {
        Self {
            replay_buffer: true,
        }
    }

    pub fn has_replay_buffer(&self) -> bool {
        self.replay_buffer
    }
}

/// An experience buffer that must be warmed up before the first training iteration.
pub trait ReplayMemory: Send {
    fn is_full(&self) -> bool;

    /// Fills the memory by interacting with the environment.
    fn fill(&mut self) -> anyhow::Result<()>;
}

/// Everything a trainer is built from.
pub struct TrainerContext<E> {
    pub env: EnvHandle<E>,
    pub rank: usize,
    /// Opaque policy configuration.
    pub policy_config: Value,
    /// The name this rank logs under.
    pub log_name: String,
    pub random_seed: Option<u64>,
    /// Extra trainer configuration.
    pub kwargs: Value,
    pub concurrency: ConcurrencyHints,
}

/// Builds the trainer of a rank.
pub trait TrainerFactory<E>: Send + Sync {
    type Trainer: Trainer;

    fn build(&self, ctx: TrainerContext<E>) -> anyhow::Result<Self::Trainer>;
}

/// The learning algorithm driven by a worker's lifecycle.
///
/// Iterations report through `anyhow::Error`, any error ends the worker's lifecycle.
#[trait_variant::make(Trainer: Send)]
pub trait TrainerTemplate {
    /// Every variable the trainer needs, names starting with `local` are rank-private.
    fn variables(&self) -> Vec<VariableSpec>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// The replay memory, only consulted when the capabilities declare one.
    fn replay_memory(&mut self) -> Option<&mut dyn ReplayMemory> {
        None
    }

    /// Copies the shared parameters into the local ones.
    async fn sync(&mut self, session: &Session) -> anyhow::Result<()>;

    /// Starts any background activity, e.g. environment runners.
    ///
    /// # Arguments
    /// * `session` - The session with the coordination layer.
    /// * `summary` - Where the trainer writes its telemetry.
    async fn start(&mut self, session: &Session, summary: SummaryWriter) -> anyhow::Result<()>;

    /// Runs a single training iteration.
    ///
    /// An iteration is expected to advance the shared global step through the session.
    async fn process(&mut self, session: &Session) -> anyhow::Result<()>;
}
