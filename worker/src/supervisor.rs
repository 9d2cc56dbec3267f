use comms::specs::{ClusterSpec, WorkerStatus};
use log::{debug, error, info, warn};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;

use crate::{
    Environment, Initializers, Result, Session, SummaryWriter, SupervisorErr, Trainer,
    TrainingLoop, TrainingUnit, VariableSet, WorkerConfig, WorkerErr,
    checkpoint::{CheckpointTimer, Saver},
    state::{Lifecycle, Phase},
};

/// The summary tag under which the final global step is recorded.
pub const FINAL_STEP_TAG: &str = "global_step/final";

/// How a successful lifecycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub rank: usize,
    /// The last global step observed before stopping.
    pub final_step: u64,
    /// Whether this rank was elected to initialize the shared state.
    pub initialized_shared_state: bool,
    pub history: Vec<Phase>,
}

/// Owns a training unit and takes it through its lifecycle.
///
/// The supervisor connects to the coordination layer, gets the shared state initialized
/// (restoring the latest checkpoint when this rank is elected to do so), runs the
/// training loop and tears everything down. The environment is closed exactly once on
/// every path out of `run`.
pub struct Supervisor<E, T> {
    config: WorkerConfig,
    cluster: ClusterSpec,
    unit: TrainingUnit<E, T>,
    lifecycle: Lifecycle,
    stop: CancellationToken,
}

impl<E, T> Supervisor<E, T>
where
    E: Environment,
    T: Trainer,
{
    /// Creates a new `Supervisor`.
    ///
    /// # Arguments
    /// * `config` - The worker's configuration.
    /// * `cluster` - The cluster topology.
    /// * `unit` - The training unit to supervise.
    /// * `status` - Where the lifecycle publishes its status.
    /// * `stop` - The process-local stop signal.
    pub fn new(
        config: WorkerConfig,
        cluster: ClusterSpec,
        unit: TrainingUnit<E, T>,
        status: watch::Sender<WorkerStatus>,
        stop: CancellationToken,
    ) -> Self {
        let lifecycle = Lifecycle::new(unit.rank(), status);

        Self {
            config,
            cluster,
            unit,
            lifecycle,
            stop,
        }
    }

    pub fn rank(&self) -> usize {
        self.unit.rank()
    }

    /// Runs the lifecycle to completion.
    ///
    /// # Returns
    /// The outcome once the global step threshold is reached or a stop is requested, or
    /// a `SupervisorErr` naming the phase in which the lifecycle failed.
    pub async fn run(mut self) -> std::result::Result<Outcome, SupervisorErr> {
        let rank = self.rank();
        self.lifecycle.enter(Phase::Connecting);

        let vars = self.unit.variables().clone();
        let inits = Initializers::new(&vars, self.config.random_seed);
        let saver = Saver::new(self.config.train_dir(), &vars, self.config.max_to_keep);

        let (session, elected) = match self.synchronize(&vars, &inits, &saver).await {
            Ok(synced) => synced,
            Err(e) => {
                let phase = self.lifecycle.phase();
                self.teardown(None, None, false).await;
                return Err(self.fail(phase, e));
            }
        };

        self.lifecycle.enter(Phase::Synchronized);

        let timer = match session.is_chief() {
            true => CheckpointTimer::spawn(saver, session.clone(), self.config.save_interval),
            false => None,
        };

        if session.is_chief() && timer.is_none() {
            info!(rank = rank; "checkpointing disabled");
        }

        let trained = self.train(&session).await;
        let phase = self.lifecycle.phase();
        self.teardown(Some(&session), timer, trained.is_ok()).await;

        match trained {
            Ok(final_step) => {
                self.lifecycle.enter(Phase::Terminated);
                info!(rank = rank; "terminated at step {final_step}");

                Ok(Outcome {
                    rank,
                    final_step,
                    initialized_shared_state: elected,
                    history: self.lifecycle.history().to_vec(),
                })
            }
            Err(e) => Err(self.fail(phase, e)),
        }
    }

    /// Opens the session and waits until the shared state is initialized.
    ///
    /// # Returns
    /// The session and whether this rank was elected to initialize the shared state.
    async fn synchronize(
        &mut self,
        vars: &VariableSet,
        inits: &Initializers,
        saver: &Saver,
    ) -> Result<(Session, bool)> {
        let rank = self.rank();
        let names = vars.global_names();

        let session = tokio::select! {
            session = Session::connect(
                &self.cluster,
                rank,
                vars,
                self.config.connect_retry,
                self.stop.clone(),
            ) => session?,
            _ = self.stop.cancelled() => return Err(WorkerErr::Interrupted),
        };

        let elected = session.is_chief() && session.claim_init().await?;
        let mut ran_init_all = false;

        if elected {
            info!(rank = rank; "initializing shared state");

            match saver.restore(&session).await? {
                Some(step) => {
                    info!(rank = rank; "restored checkpoint at step {step}");
                    let missing = session.uninitialized(&names).await?;

                    if !missing.is_empty() {
                        warn!(rank = rank, missing = missing.len(); "checkpoint misses variables, initializing them");
                        inits.init_op.run_only(&session, &missing).await?;
                    }
                }
                None => {
                    debug!(rank = rank; "no checkpoint found, initializing every variable");
                    inits.init_all.run(&session).await?;
                    ran_init_all = true;
                }
            }

            session.finish_init().await?;
        }

        if !ran_init_all {
            inits.local_init.run(&session).await?;
        }

        self.wait_until_ready(&session, &names).await?;
        Ok((session, elected))
    }

    /// Polls the readiness check until every global variable is initialized and the
    /// elected session finished initializing, so the global step is already restored.
    async fn wait_until_ready(&mut self, session: &Session, names: &[String]) -> Result<()> {
        loop {
            let readiness = session.readiness(names).await?;

            if readiness.is_ready() {
                return Ok(());
            }

            info!(
                rank = self.rank(),
                missing = readiness.missing.len(),
                init_done = readiness.init_done;
                "waiting for shared state"
            );

            tokio::select! {
                _ = time::sleep(self.config.recovery_wait) => {}
                _ = self.stop.cancelled() => return Err(WorkerErr::Interrupted),
            }
        }
    }

    async fn train(&mut self, session: &Session) -> Result<u64> {
        let rank = self.rank();
        self.lifecycle.enter(Phase::Running);

        let summary = SummaryWriter::create(&self.config.log_dir, rank).await?;
        let trainer = self.unit.trainer_mut();

        trainer
            .sync(session)
            .await
            .map_err(|source| WorkerErr::Trainer { op: "sync", source })?;

        trainer
            .start(session, summary.clone())
            .await
            .map_err(|source| WorkerErr::Trainer { op: "start", source })?;

        let global_step = session.global_step().await?;
        self.lifecycle.observe_step(global_step);
        info!(rank = rank; "starting training at step {global_step}");

        self.warm_up()?;

        let final_step = TrainingLoop::new(self.config.max_train_steps)
            .run(self.unit.trainer_mut(), session, global_step, &self.lifecycle)
            .await?;

        info!(rank = rank; "reached {final_step} steps, stopping");

        let written = match summary.scalar(FINAL_STEP_TAG, final_step as f64, final_step).await {
            Ok(()) => summary.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!(rank = rank; "failed to write summary: {e}");
        }

        Ok(final_step)
    }

    /// Fills the trainer's replay memory once, if it declared one and it's not full.
    fn warm_up(&mut self) -> Result<()> {
        if !self.unit.capabilities().has_replay_buffer() {
            return Ok(());
        }

        let rank = self.rank();
        let memory = self
            .unit
            .trainer_mut()
            .replay_memory()
            .ok_or(WorkerErr::MissingCapability("replay memory"))?;

        if !memory.is_full() {
            info!(rank = rank; "filling replay memory");
            memory.fill().map_err(WorkerErr::ReplayMemory)?;
            debug!(rank = rank; "replay memory filled");
        }

        Ok(())
    }

    /// Closes the environment and releases the session.
    ///
    /// Peers are only asked to stop when training ended cleanly.
    async fn teardown(
        &mut self,
        session: Option<&Session>,
        timer: Option<CheckpointTimer>,
        clean: bool,
    ) {
        let rank = self.rank();
        self.lifecycle.enter(Phase::Stopping);

        match self.unit.close_env() {
            Ok(true) => debug!(rank = rank; "environment closed"),
            Ok(false) => {}
            Err(e) => warn!(rank = rank; "failed to close environment: {e:#}"),
        }

        if let Some(timer) = timer {
            timer.stop().await;
        }

        let Some(session) = session else {
            return;
        };

        if clean && let Err(e) = session.request_stop().await {
            warn!(rank = rank; "failed to signal peers to stop: {e}");
        }

        if let Err(e) = session.close().await {
            warn!(rank = rank; "failed to close session: {e}");
        }
    }

    fn fail(&mut self, phase: Phase, source: WorkerErr) -> SupervisorErr {
        let rank = self.rank();
        error!(rank = rank, phase = phase.as_str(); "{source}");
        self.lifecycle.enter(Phase::Failed);
        SupervisorErr::new(rank, phase, source)
    }
}
