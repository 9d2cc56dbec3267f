mod connection;
mod placement;

use std::{collections::HashMap, sync::Arc, time::Duration};

use comms::{
    msg::Command,
    specs::{ClusterSpec, PS_JOB},
};
use futures::future;
use log::info;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Result, VariableSet, WorkerErr};
use connection::Connection;
pub use placement::Placement;

/// The task hosting the global step, the stop flag and the initialization election.
const PRIMARY: usize = 0;

/// The answer to a readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// The global variables that were never assigned.
    pub missing: Vec<String>,
    /// Whether the elected session finished first-time initialization, restoring the
    /// global step included.
    pub init_done: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.init_done && self.missing.is_empty()
    }
}

/// A worker's session with the coordination layer.
///
/// It holds one connection per coordination endpoint, the placement of every global
/// variable and the rank-private store of local variables. Cloning is cheap and every
/// clone talks through the same connections, a request holds its endpoint's connection
/// until the reply arrives.
#[derive(Clone)]
pub struct Session {
    rank: usize,
    conns: Arc<[Mutex<Connection>]>,
    placement: Arc<Placement>,
    locals: Arc<parking_lot::Mutex<HashMap<String, Vec<f32>>>>,
    stop: CancellationToken,
}

impl Session {
    /// Opens a session with every coordination endpoint of `cluster`.
    ///
    /// # Arguments
    /// * `cluster` - The cluster topology.
    /// * `rank` - The rank of this worker.
    /// * `vars` - The variables this worker's trainer declares.
    /// * `connect_retry` - The delay between connection attempts.
    /// * `stop` - The process-local stop signal.
    ///
    /// # Returns
    /// The session, or an error if an endpoint breaks the protocol. Unreachable
    /// endpoints are retried forever.
    pub async fn connect(
        cluster: &ClusterSpec,
        rank: usize,
        vars: &VariableSet,
        connect_retry: Duration,
        stop: CancellationToken,
    ) -> Result<Self> {
        let addrs = cluster.tasks(PS_JOB);
        let mut conns = Vec::with_capacity(addrs.len());

        for (task, addr) in addrs.iter().enumerate() {
            let conn = Connection::open(addr, task, rank, connect_retry).await?;
            conns.push(Mutex::new(conn));
        }

        let placement = Placement::round_robin(vars.global(), conns.len());
        info!(rank = rank, endpoints = conns.len(); "session established");

        Ok(Self {
            rank,
            conns: conns.into(),
            placement: Arc::new(placement),
            locals: Arc::default(),
            stop,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Returns `true` for rank 0, the only rank that initializes shared state and
    /// writes checkpoints.
    pub fn is_chief(&self) -> bool {
        self.rank == 0
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Reads the current values of a global variable.
    pub async fn pull(&self, name: &str) -> Result<Vec<f32>> {
        let task = self.placement.task(name)?;
        self.conns[task].lock().await.pull(name).await
    }

    /// Overwrites a global variable, creating it if needed.
    pub async fn assign(&self, name: &str, values: &[f32]) -> Result<()> {
        let task = self.placement.task(name)?;
        let cmd = Command::Assign {
            name: name.to_string(),
        };

        let reply = self.conns[task]
            .lock()
            .await
            .request_with_values(cmd, values)
            .await?;

        expect_ack(reply)
    }

    /// Adds `delta` element-wise to a global variable.
    pub async fn update(&self, name: &str, delta: &[f32]) -> Result<()> {
        let task = self.placement.task(name)?;
        let cmd = Command::Update {
            name: name.to_string(),
        };

        let reply = self.conns[task]
            .lock()
            .await
            .request_with_values(cmd, delta)
            .await?;

        expect_ack(reply)
    }

    /// Reports which of the global `names` are not initialized yet.
    ///
    /// # Returns
    /// The missing names in the order given.
    pub async fn uninitialized(&self, names: &[String]) -> Result<Vec<String>> {
        Ok(self.readiness(names).await?.missing)
    }

    /// Readiness check over the global `names`.
    ///
    /// The primary endpoint is always asked, even if it hosts none of `names`, since it
    /// knows whether first-time initialization has finished.
    pub async fn readiness(&self, names: &[String]) -> Result<Readiness> {
        let mut per_task = vec![Vec::new(); self.conns.len()];

        for name in names {
            per_task[self.placement.task(name)?].push(name.clone());
        }

        let futs = per_task
            .into_iter()
            .enumerate()
            .filter(|(task, names)| *task == PRIMARY || !names.is_empty())
            .map(async |(task, names)| {
                let cmd = Command::ReportUninitialized { names };

                match self.conns[task].lock().await.request(cmd).await? {
                    Command::Uninitialized { names, init_done } => {
                        Ok::<_, WorkerErr>((task, names, init_done))
                    }
                    _ => Err(unexpected("uninitialized")),
                }
            });

        let mut readiness = Readiness {
            missing: Vec::new(),
            init_done: false,
        };

        for (task, missing, init_done) in future::try_join_all(futs).await? {
            readiness.missing.extend(missing);

            if task == PRIMARY {
                readiness.init_done = init_done;
            }
        }

        readiness
            .missing
            .sort_by_key(|name| names.iter().position(|n| n == name));

        Ok(readiness)
    }

    /// Reads the shared global step.
    pub async fn global_step(&self) -> Result<u64> {
        self.step_request(Command::GlobalStep).await
    }

    /// Atomically increments the global step by `by`.
    ///
    /// # Returns
    /// The global step after the increment.
    pub async fn advance_global_step(&self, by: u64) -> Result<u64> {
        self.step_request(Command::AdvanceStep { by }).await
    }

    /// Moves the global step forward to `value`, it never goes back.
    ///
    /// # Returns
    /// The global step after the assignment.
    pub async fn assign_global_step(&self, value: u64) -> Result<u64> {
        self.step_request(Command::AssignStep { value }).await
    }

    /// Returns `true` once this process was asked to stop or any rank raised the
    /// shared stop flag.
    pub async fn should_stop(&self) -> Result<bool> {
        if self.stop.is_cancelled() {
            return Ok(true);
        }

        match self.primary(Command::ShouldStop).await? {
            Command::StopFlag { set } => Ok(set),
            _ => Err(unexpected("stop_flag")),
        }
    }

    /// Raises the shared stop flag so every other rank winds down.
    pub async fn request_stop(&self) -> Result<()> {
        let reply = self.primary(Command::RequestStop).await?;
        expect_ack(reply)
    }

    /// Asks to be elected as the session that initializes the shared state.
    ///
    /// # Returns
    /// Whether this session must run the initialization.
    pub async fn claim_init(&self) -> Result<bool> {
        let cmd = Command::ClaimInit { rank: self.rank };

        match self.primary(cmd).await? {
            Command::InitClaim { granted } => Ok(granted),
            _ => Err(unexpected("init_claim")),
        }
    }

    /// Marks first-time initialization of the shared state as done.
    pub async fn finish_init(&self) -> Result<()> {
        let reply = self.primary(Command::FinishInit).await?;
        expect_ack(reply)
    }

    /// Returns a copy of the local variable `name`, if it was initialized.
    pub fn local(&self, name: &str) -> Option<Vec<f32>> {
        self.locals.lock().get(name).cloned()
    }

    /// Overwrites the local variable `name`.
    ///
    /// # Returns
    /// `WorkerErr::UnknownVariable` if `name` is a global variable.
    pub fn set_local(&self, name: &str, values: Vec<f32>) -> Result<()> {
        if self.placement.contains(name) {
            return Err(WorkerErr::UnknownVariable(name.to_string()));
        }

        self.locals.lock().insert(name.to_string(), values);
        Ok(())
    }

    /// Returns a handle to the process-local stop signal.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Closes every connection of this session.
    pub async fn close(&self) -> Result<()> {
        let futs = self
            .conns
            .iter()
            .map(async |conn| conn.lock().await.close().await);

        future::try_join_all(futs).await?;
        Ok(())
    }

    async fn primary(&self, cmd: Command) -> Result<Command> {
        self.conns[PRIMARY].lock().await.request(cmd).await
    }

    async fn step_request(&self, cmd: Command) -> Result<u64> {
        match self.primary(cmd).await? {
            Command::Step { value } => Ok(value),
            _ => Err(unexpected("step")),
        }
    }
}

fn expect_ack(reply: Command) -> Result<()> {
    match reply {
        Command::Ack => Ok(()),
        _ => Err(unexpected("ack")),
    }
}

fn unexpected(expected: &'static str) -> WorkerErr {
    WorkerErr::UnexpectedMessage {
        expected,
        got: "control",
    }
}
