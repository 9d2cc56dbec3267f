//! A small built-in environment and trainer pair.
//!
//! The environment is a noisy one dimensional random walk and the trainer fits a linear
//! estimate of the reward it pays, enough to run a cluster end to end without an
//! external simulator.

use anyhow::{Context, bail};
use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::Value;
use worker::{
    EnvHandle, EnvKwargs, Environment, EnvironmentFactory, Init, Session, SummaryWriter, Trainer,
    TrainerContext, TrainerFactory, VariableSpec,
};

/// The name of the environment in diagnostic mode.
pub const RANDOM_WALK_ID: &str = "RandomWalk-v0";

const FEATURES: usize = 3;
const GLOBAL_WEIGHTS: &str = "global/estimator/w";
const LOCAL_WEIGHTS: &str = "local/estimator/w";

/// A bounded random walk, the reward is the negated distance to the origin.
pub struct RandomWalk {
    position: f32,
    drift: f32,
    rng: StdRng,
    closed: bool,
}

impl RandomWalk {
    fn new(drift: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            position: 0.0,
            drift,
            rng,
            closed: false,
        }
    }

    pub fn observe(&self) -> f32 {
        self.position
    }

    /// Moves the walker.
    ///
    /// # Returns
    /// The reward of the move.
    pub fn step(&mut self) -> anyhow::Result<f32> {
        if self.closed {
            bail!("random walk is closed");
        }

        let noise: f32 = self.rng.random_range(-1.0..1.0);
        self.position = (self.position + self.drift + noise).clamp(-10.0, 10.0);
        Ok(-self.position.abs())
    }
}

impl Environment for RandomWalk {
    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Makes random walks, the drift comes from the `drift` kwarg.
pub struct DemoEnvFactory;

impl EnvironmentFactory for DemoEnvFactory {
    type Env = RandomWalk;

    fn make(&self, kwargs: &EnvKwargs) -> anyhow::Result<RandomWalk> {
        let drift = kwargs.get("drift").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        let seed = kwargs.get("seed").and_then(Value::as_u64);
        Ok(RandomWalk::new(drift, seed))
    }

    fn make_diagnostic(&self, id: &str) -> anyhow::Result<RandomWalk> {
        if id != RANDOM_WALK_ID {
            bail!("unknown diagnostic environment `{id}`");
        }

        Ok(RandomWalk::new(0.0, None))
    }
}

/// Builds `DemoTrainer`s from the `learning_rate` and `rollout` kwargs.
pub struct DemoTrainerFactory;

impl TrainerFactory<RandomWalk> for DemoTrainerFactory {
    type Trainer = DemoTrainer;

    fn build(&self, ctx: TrainerContext<RandomWalk>) -> anyhow::Result<DemoTrainer> {
        let learning_rate = match ctx.kwargs.get("learning_rate") {
            Some(v) => v.as_f64().context("`learning_rate` must be a number")? as f32,
            None => 0.01,
        };

        let rollout = match ctx.kwargs.get("rollout") {
            Some(v) => v.as_u64().context("`rollout` must be a positive integer")?,
            None => 8,
        };

        if rollout == 0 {
            bail!("`rollout` must be a positive integer");
        }

        Ok(DemoTrainer {
            env: ctx.env,
            log_name: ctx.log_name,
            learning_rate,
            rollout,
            weights: [0.0; FEATURES],
            summary: None,
            iterations: 0,
        })
    }
}

/// Fits `reward ~ w . [x, x^2, 1]` on the walk, pushing its gradient steps to the
/// shared weights.
pub struct DemoTrainer {
    env: EnvHandle<RandomWalk>,
    log_name: String,
    learning_rate: f32,
    rollout: u64,
    weights: [f32; FEATURES],
    summary: Option<SummaryWriter>,
    iterations: u64,
}

impl DemoTrainer {
    fn features(x: f32) -> [f32; FEATURES] {
        [x, x * x, 1.0]
    }

    async fn pull_weights(&mut self, session: &Session) -> anyhow::Result<()> {
        let shared = session.pull(GLOBAL_WEIGHTS).await?;
        self.weights.copy_from_slice(&shared);
        session.set_local(LOCAL_WEIGHTS, shared)?;
        Ok(())
    }

    /// Plays one rollout and returns the summed weight update and the mean reward.
    fn play(&self) -> anyhow::Result<([f32; FEATURES], f32)> {
        let mut env = self.env.lock();
        let mut delta = [0.0; FEATURES];
        let mut total = 0.0;

        for _ in 0..self.rollout {
            let f = Self::features(env.observe());
            let reward = env.step()?;
            let prediction: f32 = f.iter().zip(&self.weights).map(|(x, w)| x * w).sum();
            let error = reward - prediction;

            for (d, x) in delta.iter_mut().zip(f) {
                *d += self.learning_rate * error * x / self.rollout as f32;
            }

            total += reward;
        }

        Ok((delta, total / self.rollout as f32))
    }
}

impl Trainer for DemoTrainer {
    fn variables(&self) -> Vec<VariableSpec> {
        vec![
            VariableSpec::new(GLOBAL_WEIGHTS, FEATURES, Init::Uniform { low: -0.1, high: 0.1 }),
            VariableSpec::new(LOCAL_WEIGHTS, FEATURES, Init::Zeros),
        ]
    }

    async fn sync(&mut self, session: &Session) -> anyhow::Result<()> {
        self.pull_weights(session).await
    }

    async fn start(&mut self, _session: &Session, summary: SummaryWriter) -> anyhow::Result<()> {
        debug!("{} writes summaries to {}", self.log_name, summary.dir().display());
        self.summary = Some(summary);
        Ok(())
    }

    async fn process(&mut self, session: &Session) -> anyhow::Result<()> {
        self.pull_weights(session).await?;

        let (delta, reward) = self.play()?;
        session.update(GLOBAL_WEIGHTS, &delta).await?;
        let step = session.advance_global_step(self.rollout).await?;

        self.iterations += 1;
        if self.iterations % 10 == 0
            && let Some(summary) = &self.summary
        {
            summary.scalar("rollout/mean_reward", reward as f64, step).await?;
        }

        Ok(())
    }
}
