use std::{
    collections::BTreeMap,
    error::Error,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

/// The job name of coordination endpoints.
pub const PS_JOB: &str = "ps";
/// The job name of compute endpoints.
pub const WORKER_JOB: &str = "worker";

/// Error returned whenever a cluster topology is malformed or a task lookup misses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyErr {
    MissingJob(&'static str),
    EmptyAddress { job: String, task: usize },
    TaskOutOfRange { job: String, task: usize, tasks: usize },
}

impl Display for TopologyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingJob(job) => write!(f, "cluster has no `{job}` addresses"),
            Self::EmptyAddress { job, task } => {
                write!(f, "cluster address of {job}/{task} is empty")
            }
            Self::TaskOutOfRange { job, task, tasks } => write!(
                f,
                "task {task} is out of range for job `{job}` with {tasks} address(es)"
            ),
        }
    }
}

impl Error for TopologyErr {}

/// The cluster topology descriptor, maps a job name to its ordered list of addresses.
///
/// The position of an address inside its job is the task index (the rank) of that member.
/// Both the `ps` and `worker` jobs must be present and non empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct ClusterSpec {
    jobs: BTreeMap<String, Vec<String>>,
}

impl ClusterSpec {
    /// Creates a new `ClusterSpec` checking that it's well formed.
    ///
    /// # Arguments
    /// * `jobs` - A mapping from job name to the ordered addresses of its tasks.
    ///
    /// # Returns
    /// A new `ClusterSpec` or a `TopologyErr` if a required job is missing or an address is empty.
    pub fn new(jobs: BTreeMap<String, Vec<String>>) -> Result<Self, TopologyErr> {
        for job in [PS_JOB, WORKER_JOB] {
            if jobs.get(job).is_none_or(Vec::is_empty) {
                return Err(TopologyErr::MissingJob(job));
            }
        }

        for (job, addrs) in &jobs {
            if let Some(task) = addrs.iter().position(|addr| addr.trim().is_empty()) {
                return Err(TopologyErr::EmptyAddress {
                    job: job.clone(),
                    task,
                });
            }
        }

        Ok(Self { jobs })
    }

    /// Shorthand to build a two job cluster.
    ///
    /// # Arguments
    /// * `ps` - The addresses of the coordination endpoints.
    /// * `workers` - The addresses of the compute endpoints.
    pub fn with_jobs<P, W>(ps: P, workers: W) -> Result<Self, TopologyErr>
    where
        P: IntoIterator,
        P::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let jobs = BTreeMap::from([
            (PS_JOB.to_string(), ps.into_iter().map(Into::into).collect()),
            (WORKER_JOB.to_string(), workers.into_iter().map(Into::into).collect()),
        ]);

        Self::new(jobs)
    }

    /// Returns the ordered addresses of `job`, empty if the job is unknown.
    pub fn tasks(&self, job: &str) -> &[String] {
        self.jobs.get(job).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the amount of tasks in `job`.
    pub fn num_tasks(&self, job: &str) -> usize {
        self.tasks(job).len()
    }

    /// Looks up the address of a single task.
    ///
    /// # Arguments
    /// * `job` - The job name.
    /// * `task` - The task index inside the job.
    ///
    /// # Returns
    /// The address or a `TopologyErr` if the task has no entry.
    pub fn task_address(&self, job: &str, task: usize) -> Result<&str, TopologyErr> {
        let tasks = self.tasks(job);

        tasks
            .get(task)
            .map(String::as_str)
            .ok_or_else(|| TopologyErr::TaskOutOfRange {
                job: job.to_string(),
                task,
                tasks: tasks.len(),
            })
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for ClusterSpec {
    type Error = TopologyErr;

    fn try_from(jobs: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        Self::new(jobs)
    }
}

impl From<ClusterSpec> for BTreeMap<String, Vec<String>> {
    fn from(value: ClusterSpec) -> Self {
        value.jobs
    }
}
