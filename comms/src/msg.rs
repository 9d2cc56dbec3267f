use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize, specs::status::WorkerStatus};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const VALUES: Header = 2;

/// The control command for the `Control` variant of the `Msg` enum.
///
/// Requests flow from a worker session to a coordination endpoint, replies flow back.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Opens a session for the given worker rank.
    Hello { rank: usize },
    /// Accepts a session, carries the task index of the answering endpoint.
    Welcome { task: usize },
    /// Asks to be elected as the session that initializes shared state.
    ClaimInit { rank: usize },
    /// The answer to `ClaimInit`.
    InitClaim { granted: bool },
    /// Marks first-time initialization as done.
    FinishInit,
    /// Readiness check, asks which of `names` are not initialized yet.
    ReportUninitialized { names: Vec<String> },
    /// The answer to `ReportUninitialized`, `init_done` is only meaningful on the
    /// primary endpoint.
    Uninitialized { names: Vec<String>, init_done: bool },
    /// Reads a variable, answered by a `Values` payload.
    Pull { name: String },
    /// Overwrites a variable with the `Values` payload that follows.
    Assign { name: String },
    /// Adds the `Values` payload that follows to a variable.
    Update { name: String },
    /// Reads the global step.
    GlobalStep,
    /// Atomically increments the global step.
    AdvanceStep { by: u64 },
    /// Moves the global step forward to `value`, used when restoring.
    AssignStep { value: u64 },
    /// The value of the global step after the request was served.
    Step { value: u64 },
    /// Reads the shared stop flag.
    ShouldStop,
    /// The answer to `ShouldStop`.
    StopFlag { set: bool },
    /// Raises the shared stop flag for every rank.
    RequestStop,
    /// Asks a compute endpoint for its status.
    Status,
    /// The answer to `Status`.
    Report(WorkerStatus),
    Ack,
    Disconnect,
}

/// The data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    Values(&'a [f32]),
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short name of the message kind, used in protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Values(_)) => "data/values",
            Msg::Err(_) => "err",
        }
    }

    fn invalid_data<T>(text: String) -> io::Result<T> {
        Err(io::Error::new(io::ErrorKind::InvalidData, text))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // SAFETY: `Command` derives `Serialize` and holds no maps with non string keys,
                //         writing it into a `Vec` cannot fail.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(Payload::Values(values)) => {
                buf.extend_from_slice(&VALUES.to_be_bytes());
                Some(bytemuck::cast_slice(*values))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind_buf, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::invalid_data(format!(
                "frame of {} bytes is too small, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        };

        match Header::from_be_bytes(*kind_buf) {
            ERR => {
                let text = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(text)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            VALUES => {
                let values = bytemuck::try_cast_slice(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad values payload: {err}"))
                })?;

                Ok(Self::Data(Payload::Values(values)))
            }
            kind => Self::invalid_data(format!("received an invalid kind header {kind}")),
        }
    }
}
