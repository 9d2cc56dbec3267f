use comms::specs::ClusterSpec;
use log::info;
use parameter_server::ParameterServer;
use tokio_util::sync::CancellationToken;
use worker::{
    ComputeEndpoint, EnvironmentFactory, Outcome, Phase, Supervisor, SupervisorErr,
    TrainerFactory, TrainingUnit,
};

use crate::{ExecutionPath, NodeConfig, NodeErr};

/// Runs the execution path of this process.
///
/// # Arguments
/// * `path` - What this process runs, see `resolve`.
/// * `config` - The node configuration.
/// * `envs` - Makes the environment of a compute process.
/// * `trainers` - Builds the trainer of a compute process.
/// * `shutdown` - Cancelled when the process is asked to stop.
///
/// # Returns
/// The outcome of a compute process, `None` for a coordination endpoint once it's
/// shut down, or the error that ended the process.
pub async fn launch<EF, TF>(
    path: ExecutionPath,
    config: &NodeConfig,
    envs: &EF,
    trainers: &TF,
    shutdown: CancellationToken,
) -> Result<Option<Outcome>, NodeErr>
where
    EF: EnvironmentFactory,
    TF: TrainerFactory<EF::Env>,
{
    match path {
        ExecutionPath::Coordinator { task } => {
            serve(&config.cluster, task, shutdown).await?;
            Ok(None)
        }
        ExecutionPath::Compute { rank } => {
            let outcome = train(rank, config, envs, trainers, shutdown).await?;
            Ok(Some(outcome))
        }
    }
}

/// Serves as coordination endpoint `task` until `shutdown` is cancelled.
pub async fn serve(
    cluster: &ClusterSpec,
    task: usize,
    shutdown: CancellationToken,
) -> Result<(), NodeErr> {
    let server = ParameterServer::bind(cluster, task).await?;

    tokio::select! {
        never = server.join() => match never {},
        _ = shutdown.cancelled() => {
            info!(task = task; "parameter server shutting down");
            Ok(())
        }
    }
}

async fn train<EF, TF>(
    rank: usize,
    config: &NodeConfig,
    envs: &EF,
    trainers: &TF,
    shutdown: CancellationToken,
) -> Result<Outcome, SupervisorErr>
where
    EF: EnvironmentFactory,
    TF: TrainerFactory<EF::Env>,
{
    let unstarted = |e| SupervisorErr::new(rank, Phase::Uninitialized, e);
    let worker_config = config.worker_config(rank);

    let endpoint = ComputeEndpoint::bind(&config.cluster, rank, config.concurrency())
        .await
        .map_err(unstarted)?;

    let unit = TrainingUnit::build(&worker_config, envs, trainers).map_err(unstarted)?;

    let supervisor = Supervisor::new(
        worker_config,
        config.cluster.clone(),
        unit,
        endpoint.status(),
        shutdown,
    );

    supervisor.run().await
}
