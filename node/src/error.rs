use std::{error::Error, fmt, io};

use comms::specs::TopologyErr;
use parameter_server::ServerErr;
use worker::SupervisorErr;

/// Everything that makes a node process exit with a failure.
#[derive(Debug)]
pub enum NodeErr {
    /// The command line is malformed.
    Usage(String),
    /// The role is neither `ps` nor `worker`.
    UnknownRole(String),
    /// The configuration file can't be read or parsed.
    Config(String),
    /// The rank has no address in the cluster.
    Topology(TopologyErr),
    Io(io::Error),
    Server(ServerErr),
    Worker(SupervisorErr),
}

impl fmt::Display for NodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(text) => write!(f, "{text}"),
            Self::UnknownRole(role) => {
                write!(f, "unknown role `{role}`, expected `ps` or `worker`")
            }
            Self::Config(text) => write!(f, "invalid configuration: {text}"),
            Self::Topology(e) => write!(f, "invalid configuration: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Server(e) => write!(f, "parameter server failed: {e}"),
            Self::Worker(e) => write!(f, "{e}"),
        }
    }
}

impl Error for NodeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Topology(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Server(e) => Some(e),
            Self::Worker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TopologyErr> for NodeErr {
    fn from(value: TopologyErr) -> Self {
        Self::Topology(value)
    }
}

impl From<io::Error> for NodeErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ServerErr> for NodeErr {
    fn from(value: ServerErr) -> Self {
        Self::Server(value)
    }
}

impl From<SupervisorErr> for NodeErr {
    fn from(value: SupervisorErr) -> Self {
        Self::Worker(value)
    }
}
