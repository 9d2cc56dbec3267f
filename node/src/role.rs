use std::{fmt, str::FromStr};

use comms::specs::{ClusterSpec, PS_JOB, WORKER_JOB};

use crate::NodeErr;

/// The role a node process plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ParameterServer,
    Worker,
}

impl Role {
    /// The cluster job holding the addresses of this role.
    pub fn job(self) -> &'static str {
        match self {
            Role::ParameterServer => PS_JOB,
            Role::Worker => WORKER_JOB,
        }
    }
}

impl FromStr for Role {
    type Err = NodeErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            PS_JOB => Ok(Role::ParameterServer),
            WORKER_JOB => Ok(Role::Worker),
            other => Err(NodeErr::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job())
    }
}

/// What a node process does once its role is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Serve as a coordination endpoint until the process is torn down.
    Coordinator { task: usize },
    /// Build a training unit and supervise it until training ends.
    Compute { rank: usize },
}

/// Decides what this process runs, before any socket is opened.
///
/// # Arguments
/// * `role` - The role name, `ps` or `worker`.
/// * `rank` - The task index of this process inside its role.
/// * `cluster` - The cluster topology.
///
/// # Returns
/// The execution path or an error if the role is unknown or the rank has no address.
pub fn resolve(role: &str, rank: usize, cluster: &ClusterSpec) -> Result<ExecutionPath, NodeErr> {
    let role: Role = role.parse()?;
    cluster.task_address(role.job(), rank)?;

    Ok(match role {
        Role::ParameterServer => ExecutionPath::Coordinator { task: rank },
        Role::Worker => ExecutionPath::Compute { rank },
    })
}
