use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kwargs key that selects the environment in diagnostic mode.
pub const DIAGNOSTIC_ID_KEY: &str = "gym_id";
/// The kwargs key flagging the rank that owns the training data.
pub const DATA_MASTER_KEY: &str = "data_master";

/// A simulated environment the trainer interacts with.
pub trait Environment: Send + 'static {
    /// Releases the environment's resources, called once per run.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Makes the environment of a rank.
pub trait EnvironmentFactory: Send + Sync {
    type Env: Environment;

    /// Makes the production environment configured by `kwargs`.
    fn make(&self, kwargs: &EnvKwargs) -> anyhow::Result<Self::Env>;

    /// Makes a standard named environment, used in test mode.
    fn make_diagnostic(&self, id: &str) -> anyhow::Result<Self::Env>;
}

/// Which constructor builds the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Production,
    Diagnostic,
}

impl EnvMode {
    pub fn from_test_mode(test_mode: bool) -> Self {
        if test_mode {
            EnvMode::Diagnostic
        } else {
            EnvMode::Production
        }
    }
}

impl fmt::Display for EnvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvMode::Production => f.write_str("production"),
            EnvMode::Diagnostic => f.write_str("diagnostic"),
        }
    }
}

/// The configuration handed to the environment factory, an opaque JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvKwargs(Map<String, Value>);

impl EnvKwargs {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Returns `true` if this rank owns the training data, `false` when unset.
    pub fn data_master(&self) -> bool {
        self.0
            .get(DATA_MASTER_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns the name of the standard environment to make in diagnostic mode.
    pub fn diagnostic_id(&self) -> Option<&str> {
        self.0.get(DIAGNOSTIC_ID_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// A shared handle to an environment.
///
/// The trainer and the lifecycle both hold one, the lifecycle is the only side that
/// closes it and closing is idempotent.
pub struct EnvHandle<E> {
    env: Arc<Mutex<E>>,
    closed: Arc<AtomicBool>,
}

impl<E> Clone for EnvHandle<E> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<E: Environment> EnvHandle<E> {
    pub fn new(env: E) -> Self {
        Self {
            env: Arc::new(Mutex::new(env)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Locks the environment for exclusive use.
    pub fn lock(&self) -> MutexGuard<'_, E> {
        self.env.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the environment unless it was already closed.
    ///
    /// # Returns
    /// `Ok(true)` if this call closed it, `Ok(false)` if it was closed before, or the
    /// environment's error. A failed close is not retried.
    pub(crate) fn close(&self) -> anyhow::Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        self.env.lock().close().map(|_| true)
    }
}
