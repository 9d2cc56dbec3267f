use anyhow::anyhow;
use log::{debug, info, warn};

use crate::{
    Capabilities, EnvHandle, EnvMode, Environment, EnvironmentFactory, Result, Trainer,
    TrainerContext, TrainerFactory, VariableSet, WorkerConfig, WorkerErr,
    environment::DIAGNOSTIC_ID_KEY,
};

/// An environment bound to the trainer that learns from it.
///
/// The environment is made first and handed to the trainer factory, so a unit never
/// holds a trainer without an environment.
pub struct TrainingUnit<E, T> {
    rank: usize,
    env: EnvHandle<E>,
    trainer: T,
    variables: VariableSet,
    capabilities: Capabilities,
}

impl<E, T> TrainingUnit<E, T>
where
    E: Environment,
    T: Trainer,
{
    /// Builds the training unit of a worker.
    ///
    /// In test mode the environment comes from the factory's diagnostic constructor,
    /// named by the `gym_id` kwarg, otherwise from its production constructor. If the
    /// trainer can't be built the environment is closed before returning.
    ///
    /// # Arguments
    /// * `config` - The worker's configuration.
    /// * `env_factory` - Makes the environment.
    /// * `trainer_factory` - Builds the trainer around the environment.
    ///
    /// # Returns
    /// The unit, or an error naming the rank if either part can't be built.
    pub fn build<EF, TF>(config: &WorkerConfig, env_factory: &EF, trainer_factory: &TF) -> Result<Self>
    where
        EF: EnvironmentFactory<Env = E>,
        TF: TrainerFactory<E, Trainer = T>,
    {
        let rank = config.rank;
        let mode = EnvMode::from_test_mode(config.test_mode);

        debug!(rank = rank; "making {mode} environment");

        let env = match mode {
            EnvMode::Production => {
                debug!(rank = rank, data_master = config.env_kwargs.data_master(); "production environment");
                env_factory.make(&config.env_kwargs)
            }
            EnvMode::Diagnostic => match config.env_kwargs.diagnostic_id() {
                Some(id) => env_factory.make_diagnostic(id),
                None => Err(anyhow!("diagnostic mode needs a `{DIAGNOSTIC_ID_KEY}` kwarg")),
            },
        }
        .map_err(|source| WorkerErr::EnvConstruction { rank, mode, source })?;

        let env = EnvHandle::new(env);

        let ctx = TrainerContext {
            env: env.clone(),
            rank,
            policy_config: config.policy_config.clone(),
            log_name: config.log_name(),
            random_seed: config.random_seed,
            kwargs: config.trainer_kwargs.clone(),
            concurrency: config.concurrency,
        };

        let built = trainer_factory
            .build(ctx)
            .map_err(|source| WorkerErr::TrainerConstruction { rank, source })
            .and_then(|trainer| {
                let variables = VariableSet::new(trainer.variables())?;
                Ok((trainer, variables))
            });

        let (trainer, variables) = match built {
            Ok(built) => built,
            Err(e) => {
                if let Err(close_err) = env.close() {
                    warn!(rank = rank; "failed to close environment: {close_err:#}");
                }
                return Err(e);
            }
        };

        for var in variables.iter() {
            debug!(rank = rank, local = var.is_local(); "variable {} ({} values)", var.name(), var.len());
        }

        let capabilities = trainer.capabilities();
        info!(
            rank = rank,
            global = variables.global().len(),
            local = variables.local().len();
            "training unit built"
        );

        Ok(Self {
            rank,
            env,
            trainer,
            variables,
            capabilities,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn variables(&self) -> &VariableSet {
        &self.variables
    }

    /// The capabilities the trainer declared when the unit was built.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut T {
        &mut self.trainer
    }

    pub fn env(&self) -> &EnvHandle<E> {
        &self.env
    }

    /// Closes the environment, later calls do nothing.
    ///
    /// # Returns
    /// Whether this call closed it.
    pub fn close_env(&self) -> anyhow::Result<bool> {
        self.env.close()
    }
}
