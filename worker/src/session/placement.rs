use std::collections::HashMap;

use crate::{Result, VariableSpec, WorkerErr};

/// Maps every global variable to the coordination endpoint that hosts it.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    tasks: HashMap<String, usize>,
}

impl Placement {
    /// Places `vars` round-robin over `num_tasks` endpoints in declaration order.
    ///
    /// Every rank declares the same global variables, so every rank computes the
    /// same placement.
    pub fn round_robin(vars: &[VariableSpec], num_tasks: usize) -> Self {
        let tasks = vars
            .iter()
            .enumerate()
            .map(|(i, var)| (var.name().to_string(), i % num_tasks.max(1)))
            .collect();

        Self { tasks }
    }

    /// Returns the task hosting `name`.
    pub fn task(&self, name: &str) -> Result<usize> {
        self.tasks
            .get(name)
            .copied()
            .ok_or_else(|| WorkerErr::UnknownVariable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
