use std::collections::HashMap;
use std::sync::Arc;

use crate::function::ComputeFunction;
use crate::utils::{PipelineError, Result};

/// Functions addressed by name. Topologies resolve their wiring through it.
#[derive(Debug, Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<ComputeFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&mut self, function: ComputeFunction) -> Arc<ComputeFunction> {
        let function = Arc::new(function);
        self.functions
            .insert(function.name().to_string(), function.clone());
        function
    }

    pub fn get(&self, name: &str) -> Result<Arc<ComputeFunction>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownFunction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
