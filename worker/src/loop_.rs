use crate::{Result, Session, Trainer, WorkerErr, state::Lifecycle};

/// Drives training iterations until the shared global step reaches its threshold or a
/// stop is requested.
///
/// The global step is only read back after an iteration ends, an iteration that
/// advances it by more than one may leave it past the threshold.
#[derive(Debug, Clone, Copy)]
pub struct TrainingLoop {
    max_steps: u64,
}

impl TrainingLoop {
    pub fn new(max_steps: u64) -> Self {
        Self { max_steps }
    }

    pub fn max_steps(&self) -> u64 {
        self.max_steps
    }

    /// Runs iterations until done.
    ///
    /// # Arguments
    /// * `trainer` - The trainer to run iterations of.
    /// * `session` - The session with the coordination layer.
    /// * `global_step` - The global step read right before entering the loop.
    /// * `lifecycle` - Where each observed step is published.
    ///
    /// # Returns
    /// The last observed global step, or the first error an iteration or the session
    /// reports. Errors are never retried.
    pub async fn run<T: Trainer>(
        &self,
        trainer: &mut T,
        session: &Session,
        mut global_step: u64,
        lifecycle: &Lifecycle,
    ) -> Result<u64> {
        while global_step < self.max_steps && !session.should_stop().await? {
            trainer
                .process(session)
                .await
                .map_err(|source| WorkerErr::Trainer {
                    op: "process",
                    source,
                })?;

            global_step = session.global_step().await?;
            lifecycle.observe_step(global_step);
        }

        Ok(global_step)
    }
}
