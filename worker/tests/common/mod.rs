#![allow(dead_code)]

use std::{
    convert::Infallible,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::bail;
use comms::specs::{ClusterSpec, WorkerStatus};
use parameter_server::{ParameterServer, VariableStore};
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use worker::{
    Capabilities, EnvHandle, EnvKwargs, Environment, EnvironmentFactory, Init, Outcome, Phase,
    ReplayMemory, Session, SummaryWriter, Supervisor, SupervisorErr, Trainer, TrainerContext,
    TrainerFactory, TrainingUnit, VariableSpec, WorkerConfig,
};

/// Shared counters the mocks report into.
#[derive(Clone, Default)]
pub struct Tracker {
    pub envs_made: Arc<AtomicUsize>,
    pub trainers_built: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<&'static str>>>,
    failing_close: bool,
}

impl Tracker {
    /// A tracker whose environments fail to close.
    pub fn with_failing_close() -> Self {
        Self {
            failing_close: true,
            ..Self::default()
        }
    }

    pub fn record(&self, event: &'static str) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct MockEnv {
    tracker: Tracker,
}

impl Environment for MockEnv {
    fn close(&mut self) -> anyhow::Result<()> {
        self.tracker.closes.fetch_add(1, Ordering::SeqCst);

        if self.tracker.failing_close {
            bail!("simulator hung up");
        }

        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockEnvFactory {
    pub tracker: Tracker,
    pub fail: bool,
}

impl MockEnvFactory {
    fn make_env(&self) -> anyhow::Result<MockEnv> {
        if self.fail {
            bail!("simulator not reachable");
        }

        self.tracker.envs_made.fetch_add(1, Ordering::SeqCst);
        Ok(MockEnv {
            tracker: self.tracker.clone(),
        })
    }
}

impl EnvironmentFactory for MockEnvFactory {
    type Env = MockEnv;

    fn make(&self, _kwargs: &EnvKwargs) -> anyhow::Result<MockEnv> {
        self.make_env()
    }

    fn make_diagnostic(&self, _id: &str) -> anyhow::Result<MockEnv> {
        self.tracker.record("diagnostic");
        self.make_env()
    }
}

#[derive(Clone)]
pub struct MockTrainerFactory {
    pub tracker: Tracker,
    pub fail: bool,
    pub replay_memory: bool,
    pub fail_at: Option<usize>,
    pub step_by: u64,
    pub delay: Duration,
}

impl MockTrainerFactory {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            fail: false,
            replay_memory: false,
            fail_at: None,
            step_by: 1,
            delay: Duration::ZERO,
        }
    }
}

impl TrainerFactory<MockEnv> for MockTrainerFactory {
    type Trainer = MockTrainer;

    fn build(&self, ctx: TrainerContext<MockEnv>) -> anyhow::Result<MockTrainer> {
        if self.fail {
            bail!("bad policy config");
        }

        self.tracker.trainers_built.fetch_add(1, Ordering::SeqCst);

        let memory = self.replay_memory.then(|| MockMemory {
            full: false,
            tracker: self.tracker.clone(),
        });

        Ok(MockTrainer {
            tracker: self.tracker.clone(),
            env: ctx.env,
            memory,
            iterations: 0,
            fail_at: self.fail_at,
            step_by: self.step_by,
            delay: self.delay,
        })
    }
}

pub struct MockMemory {
    full: bool,
    tracker: Tracker,
}

impl ReplayMemory for MockMemory {
    fn is_full(&self) -> bool {
        self.full
    }

    fn fill(&mut self) -> anyhow::Result<()> {
        self.tracker.record("fill");
        self.full = true;
        Ok(())
    }
}

pub struct MockTrainer {
    tracker: Tracker,
    env: EnvHandle<MockEnv>,
    memory: Option<MockMemory>,
    iterations: usize,
    fail_at: Option<usize>,
    step_by: u64,
    delay: Duration,
}

impl Trainer for MockTrainer {
    fn variables(&self) -> Vec<VariableSpec> {
        declared_variables()
    }

    fn capabilities(&self) -> Capabilities {
        match self.memory {
            Some(_) => Capabilities::with_replay_buffer(),
            None => Capabilities::NONE,
        }
    }

    fn replay_memory(&mut self) -> Option<&mut dyn ReplayMemory> {
        self.memory.as_mut().map(|m| m as &mut dyn ReplayMemory)
    }

    async fn sync(&mut self, session: &Session) -> anyhow::Result<()> {
        let w = session.pull("global/w").await?;
        session.set_local("local/w", w)?;
        self.tracker.record("sync");
        Ok(())
    }

    async fn start(&mut self, _session: &Session, _summary: SummaryWriter) -> anyhow::Result<()> {
        self.tracker.record("start");
        Ok(())
    }

    async fn process(&mut self, session: &Session) -> anyhow::Result<()> {
        if self.env.is_closed() {
            bail!("environment closed while training");
        }

        self.iterations += 1;
        self.tracker.record("process");

        if self.fail_at == Some(self.iterations) {
            bail!("diverged at iteration {}", self.iterations);
        }

        session.update("global/w", &[0.5, 0.5]).await?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        session.advance_global_step(self.step_by).await?;
        Ok(())
    }
}

/// The variables every `MockTrainer` declares.
pub fn declared_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec::new("global/w", 2, Init::Constant { value: 1.0 }),
        VariableSpec::new("global/b", 1, Init::Zeros),
        VariableSpec::new("local/w", 2, Init::Zeros),
    ]
}

/// A coordination endpoint serving on a loopback port for the rest of the test.
pub struct Coordinator {
    pub addr: String,
    pub store: Arc<VariableStore>,
    handle: JoinHandle<Infallible>,
}

impl Coordinator {
    pub async fn start() -> Self {
        let cluster = ClusterSpec::with_jobs(["127.0.0.1:0"], ["127.0.0.1:0"]).unwrap();
        let server = ParameterServer::bind(&cluster, 0).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let store = server.store();
        let handle = tokio::spawn(server.join());

        Self {
            addr,
            store,
            handle,
        }
    }

    /// A cluster with this coordinator and `workers` compute endpoints.
    pub fn cluster(&self, workers: usize) -> ClusterSpec {
        ClusterSpec::with_jobs([self.addr.clone()], vec!["127.0.0.1:0"; workers]).unwrap()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A fresh directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    std::env::temp_dir().join(format!("worker-{name}-{}-{nanos}", std::process::id()))
}

pub fn config(rank: usize, log_dir: &Path, max_train_steps: u64) -> WorkerConfig {
    let mut config = WorkerConfig::new(rank, log_dir, max_train_steps);
    config.random_seed = Some(7);
    config.recovery_wait = Duration::from_millis(20);
    config.connect_retry = Duration::from_millis(20);
    config
}

/// Builds a training unit and supervises it to completion.
pub async fn run_worker(
    cluster: ClusterSpec,
    config: WorkerConfig,
    envs: MockEnvFactory,
    trainers: MockTrainerFactory,
    status: watch::Sender<WorkerStatus>,
    stop: CancellationToken,
) -> Result<Outcome, SupervisorErr> {
    let rank = config.rank;
    let unit = TrainingUnit::build(&config, &envs, &trainers)
        .map_err(|e| SupervisorErr::new(rank, Phase::Uninitialized, e))?;

    Supervisor::new(config, cluster, unit, status, stop).run().await
}

pub fn status(rank: usize) -> (watch::Sender<WorkerStatus>, watch::Receiver<WorkerStatus>) {
    watch::channel(WorkerStatus::new(rank))
}
