use std::{error::Error, fmt, io, path::PathBuf};

use comms::specs::TopologyErr;

use crate::{environment::EnvMode, state::Phase};

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Topology(TopologyErr),
    Bind {
        addr: String,
        source: io::Error,
    },
    EnvConstruction {
        rank: usize,
        mode: EnvMode,
        source: anyhow::Error,
    },
    TrainerConstruction {
        rank: usize,
        source: anyhow::Error,
    },
    DuplicateVariable(String),
    InvalidInit {
        name: String,
        reason: String,
    },
    UnknownVariable(String),
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    Remote(String),
    Trainer {
        op: &'static str,
        source: anyhow::Error,
    },
    MissingCapability(&'static str),
    ReplayMemory(anyhow::Error),
    Checkpoint {
        path: PathBuf,
        source: io::Error,
    },
    /// A snapshot holds a variable with a different length than the declared one.
    SnapshotMismatch {
        path: PathBuf,
        name: String,
        expected: usize,
        got: usize,
    },
    Interrupted,
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Topology(e) => write!(f, "invalid cluster topology: {e}"),
            WorkerErr::Bind { addr, source } => {
                write!(f, "failed to bind compute endpoint at {addr}: {source}")
            }
            WorkerErr::EnvConstruction { rank, mode, source } => write!(
                f,
                "worker_{rank} failed to make {mode} environment: {source:#}"
            ),
            WorkerErr::TrainerConstruction { rank, source } => {
                write!(f, "worker_{rank} failed to build trainer: {source:#}")
            }
            WorkerErr::DuplicateVariable(name) => {
                write!(f, "variable `{name}` is declared more than once")
            }
            WorkerErr::InvalidInit { name, reason } => {
                write!(f, "invalid initializer for `{name}`: {reason}")
            }
            WorkerErr::UnknownVariable(name) => {
                write!(f, "variable `{name}` is not a declared global variable")
            }
            WorkerErr::UnexpectedMessage { expected, got } => {
                write!(f, "unexpected message: expected {expected}, got {got}")
            }
            WorkerErr::Remote(text) => write!(f, "coordination endpoint error: {text}"),
            WorkerErr::Trainer { op, source } => {
                write!(f, "trainer failed in `{op}`: {source:#}")
            }
            WorkerErr::MissingCapability(what) => {
                write!(f, "trainer declares a {what} but does not expose one")
            }
            WorkerErr::ReplayMemory(source) => {
                write!(f, "failed to fill replay memory: {source:#}")
            }
            WorkerErr::Checkpoint { path, source } => {
                write!(f, "checkpoint error at {}: {source}", path.display())
            }
            WorkerErr::SnapshotMismatch {
                path,
                name,
                expected,
                got,
            } => write!(
                f,
                "snapshot {} holds `{name}` with {got} values, {expected} are declared",
                path.display()
            ),
            WorkerErr::Interrupted => write!(f, "interrupted before training started"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Topology(e) => Some(e),
            WorkerErr::Bind { source, .. } => Some(source),
            WorkerErr::Checkpoint { source, .. } => Some(source),
            WorkerErr::EnvConstruction { source, .. }
            | WorkerErr::TrainerConstruction { source, .. }
            | WorkerErr::Trainer { source, .. }
            | WorkerErr::ReplayMemory(source) => Some(&**source),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<TopologyErr> for WorkerErr {
    fn from(value: TopologyErr) -> Self {
        Self::Topology(value)
    }
}

/// A fatal failure of a worker's lifecycle, it identifies the rank and the phase
/// the lifecycle was in when it failed.
#[derive(Debug)]
pub struct SupervisorErr {
    pub rank: usize,
    pub phase: Phase,
    pub source: WorkerErr,
}

impl SupervisorErr {
    pub fn new(rank: usize, phase: Phase, source: WorkerErr) -> Self {
        Self {
            rank,
            phase,
            source,
        }
    }
}

impl fmt::Display for SupervisorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker_{} failed while {}: {}",
            self.rank, self.phase, self.source
        )
    }
}

impl Error for SupervisorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}
