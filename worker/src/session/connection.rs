use std::time::Duration;

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, warn};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{Result, WorkerErr};

const STARTING_RX_BUF_SIZE: usize = 1024;

/// A request/reply channel to a single coordination endpoint.
pub(crate) struct Connection {
    task: usize,
    rx: WireReceiver<OwnedReadHalf>,
    tx: WireSender<OwnedWriteHalf>,
    rx_buf: Vec<u32>,
}

impl Connection {
    /// Connects to the coordination endpoint at `addr` and opens a session.
    ///
    /// Connecting is retried forever every `retry`, an endpoint that never comes up
    /// keeps this call pending.
    ///
    /// # Arguments
    /// * `addr` - The address of the endpoint.
    /// * `task` - Its task index inside the `ps` job.
    /// * `rank` - The rank opening the session.
    /// * `retry` - The delay between connection attempts.
    pub async fn open(addr: &str, task: usize, rank: usize, retry: Duration) -> Result<Self> {
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(rank = rank, task = task; "coordination endpoint {addr} not reachable yet: {e}");
                    time::sleep(retry).await;
                }
            }
        };

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        let mut conn = Self {
            task,
            rx,
            tx,
            rx_buf: Vec::with_capacity(STARTING_RX_BUF_SIZE),
        };

        match conn.request(Command::Hello { rank }).await? {
            Command::Welcome { task: answered } if answered == task => {}
            Command::Welcome { task: answered } => {
                warn!(rank = rank, task = task; "endpoint at {addr} answered as task {answered}");
            }
            _ => return Err(conn.unexpected("welcome", "control")),
        }

        debug!(rank = rank, task = task; "session opened with {addr}");
        Ok(conn)
    }

    /// Sends `cmd` and waits for its control reply.
    pub async fn request(&mut self, cmd: Command) -> Result<Command> {
        self.tx.send(&Msg::Control(cmd)).await?;
        self.recv_reply().await
    }

    /// Sends `cmd` followed by `values` and waits for its control reply.
    pub async fn request_with_values(&mut self, cmd: Command, values: &[f32]) -> Result<Command> {
        self.tx.send(&Msg::Control(cmd)).await?;
        self.tx.send(&Msg::Data(Payload::Values(values))).await?;
        self.recv_reply().await
    }

    /// Reads the values of `name`.
    pub async fn pull(&mut self, name: &str) -> Result<Vec<f32>> {
        let cmd = Command::Pull {
            name: name.to_string(),
        };

        self.tx.send(&Msg::Control(cmd)).await?;

        match self.rx.recv_into(&mut self.rx_buf).await? {
            Msg::Data(Payload::Values(values)) => Ok(values.to_vec()),
            Msg::Err(text) => Err(WorkerErr::Remote(text.into_owned())),
            msg => Err(WorkerErr::UnexpectedMessage {
                expected: "data/values",
                got: msg.kind(),
            }),
        }
    }

    /// Closes the session, waiting for the endpoint to acknowledge it.
    pub async fn close(&mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::Disconnect)).await?;

        loop {
            match self.rx.recv_into(&mut self.rx_buf).await? {
                Msg::Control(Command::Disconnect) => break,
                msg => debug!(task = self.task; "dropping {} message while closing", msg.kind()),
            }
        }

        self.tx.shutdown().await?;
        Ok(())
    }

    async fn recv_reply(&mut self) -> Result<Command> {
        match self.rx.recv_into(&mut self.rx_buf).await? {
            Msg::Control(cmd) => Ok(cmd),
            Msg::Err(text) => Err(WorkerErr::Remote(text.into_owned())),
            msg => Err(WorkerErr::UnexpectedMessage {
                expected: "control",
                got: msg.kind(),
            }),
        }
    }

    fn unexpected(&self, expected: &'static str, got: &'static str) -> WorkerErr {
        debug!(task = self.task; "protocol violation, expected {expected}");
        WorkerErr::UnexpectedMessage { expected, got }
    }
}
