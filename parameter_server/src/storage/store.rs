use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use super::{Result, StoreErr, Variable};

/// Progress of the first-time initialization of the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Claimed { rank: usize },
    Done,
}

/// The key-value store of global variables hosted by a coordination endpoint.
///
/// A variable is initialized once it has been assigned, the readiness check reports the
/// names that were never assigned. Besides the variables it holds the canonical global step,
/// the shared stop flag and the initialization election, these three are only consulted
/// on the primary task.
#[derive(Debug)]
pub struct VariableStore {
    vars: RwLock<HashMap<String, Arc<Variable>>>,
    global_step: AtomicU64,
    stop: AtomicBool,
    init: Mutex<InitState>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    /// Creates a new empty `VariableStore`.
    pub fn new() -> Self {
        Self {
            vars: RwLock::new(HashMap::new()),
            global_step: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            init: Mutex::new(InitState::Uninitialized),
        }
    }

    /// Returns the amount of initialized variables.
    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    /// Returns `true` if no variable was initialized yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports which of `names` are not initialized, keeping their order.
    pub fn uninitialized(&self, names: &[String]) -> Vec<String> {
        let vars = self.vars.read();

        names
            .iter()
            .filter(|name| !vars.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Copies the values of `name` into `out`.
    ///
    /// # Returns
    /// `StoreErr::Uninitialized` if the variable was never assigned.
    pub fn pull(&self, name: &str, out: &mut Vec<f32>) -> Result<()> {
        self.get(name)?.read_into(out);
        Ok(())
    }

    /// Creates `name` holding `values`, or overwrites it if it already exists.
    ///
    /// # Returns
    /// `StoreErr::SizeMismatch` if the variable exists with a different length.
    pub fn assign(&self, name: &str, values: &[f32]) -> Result<()> {
        if let Ok(var) = self.get(name) {
            Self::check_len(name, &var, values)?;
            var.write(values);
            return Ok(());
        }

        let mut vars = self.vars.write();

        match vars.get(name) {
            // Someone created it between both locks.
            Some(var) => {
                Self::check_len(name, var, values)?;
                var.write(values);
            }
            None => {
                vars.insert(name.to_string(), Arc::new(Variable::new(values)));
            }
        }

        Ok(())
    }

    /// Adds `delta` to the values of `name`.
    ///
    /// # Returns
    /// `StoreErr::Uninitialized` if the variable was never assigned or
    /// `StoreErr::SizeMismatch` if `delta` doesn't match its length.
    pub fn update(&self, name: &str, delta: &[f32]) -> Result<()> {
        let var = self.get(name)?;
        Self::check_len(name, &var, delta)?;
        var.add(delta);
        Ok(())
    }

    /// Returns the global step.
    pub fn global_step(&self) -> u64 {
        self.global_step.load(Ordering::Acquire)
    }

    /// Increments the global step by `by`.
    ///
    /// # Returns
    /// The value of the global step after the increment.
    pub fn advance_step(&self, by: u64) -> u64 {
        self.global_step.fetch_add(by, Ordering::AcqRel) + by
    }

    /// Moves the global step to `value` if it's ahead, the step never goes back.
    ///
    /// # Returns
    /// The value of the global step after the assignment.
    pub fn assign_step(&self, value: u64) -> u64 {
        self.global_step.fetch_max(value, Ordering::AcqRel).max(value)
    }

    /// Raises the stop flag, it stays raised for the lifetime of the store.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Returns `true` once any session requested the cluster to stop.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Elects the session responsible for first-time initialization.
    ///
    /// The first claimant wins while the shared state is uninitialized, the same rank
    /// may claim again if it reconnects before finishing.
    ///
    /// # Arguments
    /// * `rank` - The rank of the claiming worker.
    ///
    /// # Returns
    /// Whether `rank` must initialize the shared state.
    pub fn claim_init(&self, rank: usize) -> bool {
        let mut init = self.init.lock();

        match *init {
            InitState::Uninitialized => {
                *init = InitState::Claimed { rank };
                true
            }
            InitState::Claimed { rank: owner } => owner == rank,
            InitState::Done => false,
        }
    }

    /// Marks first-time initialization as done.
    pub fn finish_init(&self) {
        *self.init.lock() = InitState::Done;
    }

    /// Returns the progress of the first-time initialization.
    pub fn init_state(&self) -> InitState {
        *self.init.lock()
    }

    fn get(&self, name: &str) -> Result<Arc<Variable>> {
        self.vars
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreErr::Uninitialized(name.to_string()))
    }

    fn check_len(name: &str, var: &Variable, values: &[f32]) -> Result<()> {
        let expected = var.len();

        if values.len() != expected {
            return Err(StoreErr::SizeMismatch {
                name: name.to_string(),
                got: values.len(),
                expected,
            });
        }

        Ok(())
    }
}
