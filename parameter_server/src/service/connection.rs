use std::{io, sync::Arc};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task,
};

use crate::storage::{InitState, StoreErr, VariableStore};

const STARTING_RX_BUF_SIZE: usize = 1024;

/// Serves a single worker session until it disconnects.
///
/// The session must open with `Hello`, every following request is answered in order.
/// Requests the store can't serve are answered with an error message and the session
/// keeps going, only I/O failures and protocol violations end it.
///
/// # Arguments
/// * `task` - The task index of this coordination endpoint.
/// * `store` - The shared variable store.
/// * `rx` - The receiving end of the communication.
/// * `tx` - The sending end of the communication.
///
/// # Returns
/// An io error if the session ended abnormally.
pub async fn serve<R, W>(
    task: usize,
    store: Arc<VariableStore>,
    mut rx: WireReceiver<R>,
    mut tx: WireSender<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx_buf: Vec<u32> = Vec::with_capacity(STARTING_RX_BUF_SIZE);
    let mut values = Vec::new();

    let rank = match rx.recv_into(&mut rx_buf).await? {
        Msg::Control(Command::Hello { rank }) => rank,
        msg => {
            let kind = msg.kind();
            tx.send(&Msg::Err("expected hello".into())).await?;
            return unexpected(kind);
        }
    };

    tx.send(&Msg::Control(Command::Welcome { task })).await?;
    info!(task = task, rank = rank; "session opened");

    loop {
        let cmd = match rx.recv_into(&mut rx_buf).await {
            Ok(Msg::Control(cmd)) => cmd,
            Ok(msg) => return unexpected(msg.kind()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(task = task, rank = rank; "session dropped without disconnecting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reply = match cmd {
            Command::Pull { name } => match store.pull(&name, &mut values) {
                Ok(()) => {
                    tx.send(&Msg::Data(Payload::Values(&values))).await?;
                    continue;
                }
                Err(e) => Err(e),
            },
            Command::Assign { name } => {
                let data = recv_values(&mut rx, &mut rx_buf).await?;
                store.assign(&name, data).map(|_| Command::Ack)
            }
            Command::Update { name } => {
                let data = recv_values(&mut rx, &mut rx_buf).await?;
                task::block_in_place(|| store.update(&name, data)).map(|_| Command::Ack)
            }
            Command::ReportUninitialized { names } => Ok(Command::Uninitialized {
                names: store.uninitialized(&names),
                init_done: store.init_state() == InitState::Done,
            }),
            Command::ClaimInit { rank } => {
                let granted = store.claim_init(rank);
                debug!(task = task, rank = rank, granted = granted; "initialization claimed");
                Ok(Command::InitClaim { granted })
            }
            Command::FinishInit => {
                store.finish_init();
                info!(task = task, rank = rank; "shared state initialized");
                Ok(Command::Ack)
            }
            Command::GlobalStep => Ok(Command::Step {
                value: store.global_step(),
            }),
            Command::AdvanceStep { by } => Ok(Command::Step {
                value: store.advance_step(by),
            }),
            Command::AssignStep { value } => Ok(Command::Step {
                value: store.assign_step(value),
            }),
            Command::ShouldStop => Ok(Command::StopFlag {
                set: store.should_stop(),
            }),
            Command::RequestStop => {
                if !store.should_stop() {
                    info!(task = task, rank = rank; "stop requested");
                }

                store.request_stop();
                Ok(Command::Ack)
            }
            Command::Disconnect => {
                tx.send(&Msg::Control(Command::Disconnect)).await?;
                info!(task = task, rank = rank; "session closed");
                return Ok(());
            }
            other => {
                warn!(task = task, rank = rank; "unsupported request {other:?}");
                let text = format!("unsupported request: {other:?}");
                tx.send(&Msg::Err(text.into())).await?;
                continue;
            }
        };

        match reply {
            Ok(cmd) => tx.send(&Msg::Control(cmd)).await?,
            Err(e) => send_store_err(&mut tx, task, rank, e).await?,
        }
    }
}

/// Receives the values frame that follows an `Assign` or `Update` request.
async fn recv_values<'buf, R>(
    rx: &mut WireReceiver<R>,
    rx_buf: &'buf mut Vec<u32>,
) -> io::Result<&'buf [f32]>
where
    R: AsyncRead + Unpin,
{
    match rx.recv_into(rx_buf).await? {
        Msg::Data(Payload::Values(values)) => Ok(values),
        msg => unexpected(msg.kind()),
    }
}

async fn send_store_err<W>(
    tx: &mut WireSender<W>,
    task: usize,
    rank: usize,
    err: StoreErr,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(task = task, rank = rank; "rejected request: {err}");
    tx.send(&Msg::Err(err.to_string().into())).await
}

fn unexpected<T>(kind: &str) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("received an unexpected message kind, got: {kind}"),
    ))
}
