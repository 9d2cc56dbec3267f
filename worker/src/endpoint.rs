use std::{io, net::SocketAddr, num::NonZeroUsize};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg},
    specs::{ClusterSpec, WORKER_JOB, WorkerStatus},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    runtime::{self, Runtime},
    sync::watch,
    task::JoinHandle,
};

use crate::{Result, WorkerErr};

/// Thread pool sizing hints for a compute process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyHints {
    /// Threads a single operation may use.
    pub intra_op: NonZeroUsize,
    /// Operations that may run at the same time.
    pub inter_op: NonZeroUsize,
}

impl Default for ConcurrencyHints {
    fn default() -> Self {
        Self {
            intra_op: NonZeroUsize::MIN,
            inter_op: NonZeroUsize::MIN.saturating_add(1),
        }
    }
}

impl ConcurrencyHints {
    pub fn new(intra_op: NonZeroUsize, inter_op: NonZeroUsize) -> Self {
        Self { intra_op, inter_op }
    }

    /// Builds the runtime of a compute process sized by these hints.
    pub fn runtime(&self) -> io::Result<Runtime> {
        runtime::Builder::new_multi_thread()
            .worker_threads(self.inter_op.get())
            .max_blocking_threads(self.intra_op.get())
            .thread_name("worker")
            .enable_all()
            .build()
    }
}

/// The compute endpoint of a worker, it answers status queries for the rest of the
/// worker's lifetime.
pub struct ComputeEndpoint {
    rank: usize,
    addr: SocketAddr,
    hints: ConcurrencyHints,
    status: watch::Sender<WorkerStatus>,
    handle: JoinHandle<()>,
}

impl ComputeEndpoint {
    /// Binds the compute endpoint of `rank` to its address in `cluster`.
    ///
    /// # Arguments
    /// * `cluster` - The cluster topology.
    /// * `rank` - The task index of this worker inside the `worker` job.
    /// * `hints` - The concurrency hints of this process.
    ///
    /// # Returns
    /// The bound endpoint or an error if the address is missing or can't be bound.
    pub async fn bind(cluster: &ClusterSpec, rank: usize, hints: ConcurrencyHints) -> Result<Self> {
        let addr = cluster.task_address(WORKER_JOB, rank)?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| WorkerErr::Bind {
                addr: addr.to_string(),
                source,
            })?;

        let local = listener.local_addr()?;
        info!(rank = rank, addr = addr; "compute endpoint started");

        let (status, _) = watch::channel(WorkerStatus::new(rank));
        let handle = tokio::spawn(accept(rank, listener, status.clone()));

        Ok(Self {
            rank,
            addr: local,
            hints,
            status,
            handle,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hints(&self) -> ConcurrencyHints {
        self.hints
    }

    /// Returns the sender the lifecycle publishes its status through.
    pub fn status(&self) -> watch::Sender<WorkerStatus> {
        self.status.clone()
    }
}

impl Drop for ComputeEndpoint {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept(rank: usize, listener: TcpListener, status: watch::Sender<WorkerStatus>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(rank = rank; "status connection from {peer}");
                let (rx, tx) = stream.into_split();
                let (rx, tx) = comms::channel(rx, tx);
                let status = status.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = answer(rx, tx, status).await {
                        warn!(rank = rank; "status connection from {peer} failed: {e}");
                    }
                });
            }
            Err(e) => warn!(rank = rank; "failed to accept a status connection: {e}"),
        }
    }
}

async fn answer<R, W>(
    mut rx: WireReceiver<R>,
    mut tx: WireSender<W>,
    status: watch::Receiver<WorkerStatus>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx_buf: Vec<u32> = Vec::new();

    loop {
        let reply = match rx.recv_into(&mut rx_buf).await {
            Ok(Msg::Control(Command::Status)) => {
                let report = status.borrow().clone();
                Msg::Control(Command::Report(report))
            }
            Ok(Msg::Control(Command::Disconnect)) => {
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                return Ok(());
            }
            Ok(msg) => Msg::Err(format!("unsupported {} message", msg.kind()).into()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        tx.send(&reply).await?;
    }
}

/// Asks the compute endpoint at `addr` for its status.
pub async fn query_status(addr: &str) -> Result<WorkerStatus> {
    let stream = TcpStream::connect(addr).await?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);
    let mut rx_buf: Vec<u32> = Vec::new();

    tx.send(&Msg::Control(Command::Status)).await?;

    let status = match rx.recv_into(&mut rx_buf).await? {
        Msg::Control(Command::Report(status)) => status,
        Msg::Err(text) => return Err(WorkerErr::Remote(text.into_owned())),
        msg => {
            return Err(WorkerErr::UnexpectedMessage {
                expected: "report",
                got: msg.kind(),
            });
        }
    };

    tx.send(&Msg::Control(Command::Disconnect)).await?;
    Ok(status)
}
