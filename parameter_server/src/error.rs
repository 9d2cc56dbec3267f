use std::{error::Error, fmt, io};

use comms::specs::TopologyErr;

/// Failures of a coordination endpoint before it starts serving.
#[derive(Debug)]
pub enum ServerErr {
    /// The task has no address in the cluster topology.
    Topology(TopologyErr),
    /// The listening socket couldn't be bound, this is never retried.
    Bind { addr: String, source: io::Error },
}

impl fmt::Display for ServerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topology(e) => write!(f, "invalid topology: {e}"),
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
        }
    }
}

impl Error for ServerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Topology(e) => Some(e),
            Self::Bind { source, .. } => Some(source),
        }
    }
}

impl From<TopologyErr> for ServerErr {
    fn from(value: TopologyErr) -> Self {
        Self::Topology(value)
    }
}
