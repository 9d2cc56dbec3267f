use std::fmt;

use comms::specs::WorkerStatus;
use log::debug;
use tokio::sync::watch;

/// The phases a worker's lifecycle goes through.
///
/// ```text
/// Uninitialized -> Connecting -> Synchronized -> Running -> Stopping -> Terminated
/// ```
///
/// Teardown always passes through `Stopping`, a failure ends in `Failed` instead of
/// `Terminated`. A failure before the training unit exists goes straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Connecting,
    Synchronized,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl Phase {
    /// Returns `true` for the phases a lifecycle never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Terminated | Phase::Failed)
    }

    /// Returns `true` if the lifecycle may move from `self` to `next`.
    pub fn can_enter(self, next: Phase) -> bool {
        use Phase::*;

        match (self, next) {
            (Uninitialized, Connecting) => true,
            (Connecting, Synchronized) => true,
            (Synchronized, Running) => true,
            (Connecting | Synchronized | Running, Stopping) => true,
            (Stopping, Terminated) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Connecting => "connecting",
            Phase::Synchronized => "synchronized",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Terminated => "terminated",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current phase of a worker and publishes it, along with the last observed
/// global step, to whoever watches the compute endpoint's status.
#[derive(Debug)]
pub struct Lifecycle {
    rank: usize,
    phase: Phase,
    history: Vec<Phase>,
    status: watch::Sender<WorkerStatus>,
}

impl Lifecycle {
    /// Creates a new `Lifecycle` in the `Uninitialized` phase.
    ///
    /// # Arguments
    /// * `rank` - The rank of this worker.
    /// * `status` - Where status updates are published.
    pub fn new(rank: usize, status: watch::Sender<WorkerStatus>) -> Self {
        let phase = Phase::Uninitialized;

        status.send_modify(|s| {
            s.rank = rank;
            s.phase = phase.to_string();
        });

        Self {
            rank,
            phase,
            history: vec![phase],
            status,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase this lifecycle went through, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Moves the lifecycle to `next`.
    ///
    /// # Panics
    /// In debug builds, if the transition is not allowed.
    pub fn enter(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_enter(next),
            "invalid transition {} -> {next}",
            self.phase
        );

        debug!(rank = self.rank; "{} -> {next}", self.phase);
        self.phase = next;
        self.history.push(next);
        self.status.send_modify(|s| s.phase = next.to_string());
    }

    /// Publishes the last global step this worker observed.
    pub fn observe_step(&self, global_step: u64) {
        self.status.send_modify(|s| s.global_step = global_step);
    }
}
