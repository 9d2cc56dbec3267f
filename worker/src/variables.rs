use std::collections::HashSet;

use rand::{Rng, SeedableRng, distr::Uniform, rngs::StdRng};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::{Result, Session, WorkerErr};

/// Variables whose name starts with this prefix are rank-private, every other variable
/// is global and shared through the coordination layer.
pub const LOCAL_PREFIX: &str = "local";

/// How a variable's values are produced on first-time initialization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Init {
    Zeros,
    Constant { value: f32 },
    Uniform { low: f32, high: f32 },
}

/// A variable declared by a trainer.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    name: String,
    len: usize,
    init: Init,
}

impl VariableSpec {
    /// Creates a new `VariableSpec`.
    ///
    /// # Arguments
    /// * `name` - The unique name of the variable.
    /// * `len` - The amount of `f32` values it holds.
    /// * `init` - Its initial values.
    pub fn new(name: impl Into<String>, len: usize, init: Init) -> Self {
        Self {
            name: name.into(),
            len,
            init,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn init(&self) -> Init {
        self.init
    }

    /// Returns `true` if this variable is rank-private.
    pub fn is_local(&self) -> bool {
        self.name.starts_with(LOCAL_PREFIX)
    }

    /// Draws the initial values of this variable.
    ///
    /// With a seed the values only depend on the seed and the variable's name, so
    /// every initializer holding this variable produces the same values.
    pub fn sample(&self, seed: Option<u64>) -> Vec<f32> {
        match self.init {
            Init::Zeros => vec![0.0; self.len],
            Init::Constant { value } => vec![value; self.len],
            Init::Uniform { low, high } => {
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(seed ^ xxh3_64(self.name.as_bytes())),
                    None => StdRng::from_os_rng(),
                };

                // Bounds are checked when the variable set is built.
                match Uniform::new(low, high) {
                    Ok(dist) => (0..self.len).map(|_| rng.sample(&dist)).collect(),
                    Err(_) => vec![low; self.len],
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if let Init::Uniform { low, high } = self.init
            && Uniform::new(low, high).is_err()
        {
            return Err(WorkerErr::InvalidInit {
                name: self.name.clone(),
                reason: format!("uniform range [{low}, {high}) is empty or not finite"),
            });
        }

        Ok(())
    }
}

/// The variables of a trainer partitioned into global and local ones, both in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    global: Vec<VariableSpec>,
    local: Vec<VariableSpec>,
}

impl VariableSet {
    /// Creates a new `VariableSet`.
    ///
    /// # Arguments
    /// * `vars` - Every variable a trainer declares.
    ///
    /// # Returns
    /// The partitioned set or an error if a name is repeated or an initializer is invalid.
    pub fn new(vars: impl IntoIterator<Item = VariableSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut set = Self::default();

        for var in vars {
            if !seen.insert(var.name.clone()) {
                return Err(WorkerErr::DuplicateVariable(var.name));
            }

            var.validate()?;

            if var.is_local() {
                set.local.push(var);
            } else {
                set.global.push(var);
            }
        }

        Ok(set)
    }

    pub fn global(&self) -> &[VariableSpec] {
        &self.global
    }

    pub fn local(&self) -> &[VariableSpec] {
        &self.local
    }

    /// Every variable, globals first.
    pub fn iter(&self) -> impl Iterator<Item = &VariableSpec> {
        self.global.iter().chain(&self.local)
    }

    /// The names of the global variables, the ones the readiness check looks at.
    pub fn global_names(&self) -> Vec<String> {
        self.global.iter().map(|var| var.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Assigns initial values to a subset of variables.
///
/// Global variables are written through the session to the coordination layer,
/// local ones into the session's rank-private store.
#[derive(Debug, Clone)]
pub struct Initializer {
    vars: Vec<VariableSpec>,
    seed: Option<u64>,
}

impl Initializer {
    pub fn new<'a>(vars: impl IntoIterator<Item = &'a VariableSpec>, seed: Option<u64>) -> Self {
        Self {
            vars: vars.into_iter().cloned().collect(),
            seed,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(VariableSpec::name)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Initializes every variable of this initializer.
    pub async fn run(&self, session: &Session) -> Result<()> {
        self.run_filtered(session, |_| true).await
    }

    /// Initializes only the variables of this initializer named in `names`.
    pub async fn run_only(&self, session: &Session, names: &[String]) -> Result<()> {
        self.run_filtered(session, |var| names.iter().any(|n| n == var.name()))
            .await
    }

    async fn run_filtered<F>(&self, session: &Session, keep: F) -> Result<()>
    where
        F: Fn(&VariableSpec) -> bool,
    {
        for var in self.vars.iter().filter(|var| keep(var)) {
            let values = var.sample(self.seed);

            if var.is_local() {
                session.set_local(var.name(), values)?;
            } else {
                session.assign(var.name(), &values).await?;
            }
        }

        Ok(())
    }
}

/// The three initializers a lifecycle needs.
#[derive(Debug, Clone)]
pub struct Initializers {
    /// Global variables only.
    pub init_op: Initializer,
    /// Every variable, only run by the rank elected to initialize shared state.
    pub init_all: Initializer,
    /// Local variables only, never touches shared state.
    pub local_init: Initializer,
}

impl Initializers {
    pub fn new(vars: &VariableSet, seed: Option<u64>) -> Self {
        Self {
            init_op: Initializer::new(vars.global(), seed),
            init_all: Initializer::new(vars.iter(), seed),
            local_init: Initializer::new(vars.local(), seed),
        }
    }
}
