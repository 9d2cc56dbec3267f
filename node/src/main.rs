use std::{env, process::ExitCode};

use log::{error, info};
use node::{
    ExecutionPath, NodeConfig, NodeErr,
    demo::{DemoEnvFactory, DemoTrainerFactory},
    launch, resolve,
};
use tokio::{runtime::Runtime, signal};
use tokio_util::sync::CancellationToken;

const USAGE: &str = "usage: node <ps|worker> <rank> <config.json>";

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), NodeErr> {
    let args: Vec<String> = env::args().skip(1).collect();
    let [role, rank, path] = args.as_slice() else {
        return Err(NodeErr::Usage(USAGE.to_string()));
    };

    let rank: usize = rank
        .parse()
        .map_err(|_| NodeErr::Usage(format!("invalid rank `{rank}`, {USAGE}")))?;

    let config = NodeConfig::load(path)?;
    let exec = resolve(role, rank, &config.cluster)?;

    let runtime = match exec {
        ExecutionPath::Coordinator { .. } => Runtime::new()?,
        ExecutionPath::Compute { .. } => config.concurrency().runtime()?,
    };

    runtime.block_on(async {
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("received SIGINT");
                token.cancel();
            }
        });

        if let Some(outcome) =
            launch(exec, &config, &DemoEnvFactory, &DemoTrainerFactory, shutdown).await?
        {
            info!(
                rank = outcome.rank,
                global_step = outcome.final_step;
                "training finished"
            );
        }

        Ok::<_, NodeErr>(())
    })
}
