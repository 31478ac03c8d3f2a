//! Saga definitions and the registry they are looked up in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, SagaError};
use crate::retry::RetryPolicy;
use crate::step::{SagaContext, SagaStep};

struct StepEntry<C: SagaContext> {
    step: Arc<dyn SagaStep<C>>,
    retry: Option<RetryPolicy>,
    compensation_retry: Option<RetryPolicy>,
}

/// An ordered, immutable sequence of steps over a context type `C`.
///
/// Built once with [`SagaDefinition::builder`] and never changed after.
pub struct SagaDefinition<C: SagaContext> {
    name: String,
    steps: Vec<StepEntry<C>>,
    retry: RetryPolicy,
    compensation_retry: Option<RetryPolicy>,
}

impl<C: SagaContext> SagaDefinition<C> {
    /// Starts building a definition with the given name.
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder<C> {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            retry: RetryPolicy::default(),
            compensation_retry: None,
        }
    }

    /// Returns the definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the step names in order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|entry| entry.step.name()).collect()
    }

    /// Returns the step at `index`.
    pub fn step(&self, index: usize) -> Option<&Arc<dyn SagaStep<C>>> {
        self.steps.get(index).map(|entry| &entry.step)
    }

    /// Policy for the forward `execute` of the step at `index`: the step's
    /// own override, else the definition default.
    pub fn retry_policy(&self, index: usize) -> RetryPolicy {
        self.steps
            .get(index)
            .and_then(|entry| entry.retry)
            .unwrap_or(self.retry)
    }

    /// Policy for `compensate` of the step at `index`.
    ///
    /// Lookup order: the step's compensation override, the definition's
    /// compensation override, then whatever the forward direction uses.
    pub fn compensation_policy(&self, index: usize) -> RetryPolicy {
        self.steps
            .get(index)
            .and_then(|entry| entry.compensation_retry)
            .or(self.compensation_retry)
            .unwrap_or_else(|| self.retry_policy(index))
    }
}

impl<C: SagaContext> std::fmt::Debug for SagaDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<C: SagaContext> {
    name: String,
    steps: Vec<StepEntry<C>>,
    retry: RetryPolicy,
    compensation_retry: Option<RetryPolicy>,
}

impl<C: SagaContext> SagaDefinitionBuilder<C> {
    /// Appends a step using the definition's policies.
    pub fn step(self, step: impl SagaStep<C> + 'static) -> Self {
        self.push(Arc::new(step), None, None)
    }

    /// Appends a step with its own forward retry policy.
    pub fn step_with_retry(self, step: impl SagaStep<C> + 'static, retry: RetryPolicy) -> Self {
        self.push(Arc::new(step), Some(retry), None)
    }

    /// Appends a step with its own forward and compensation policies.
    pub fn step_with_policies(
        self,
        step: impl SagaStep<C> + 'static,
        retry: RetryPolicy,
        compensation_retry: RetryPolicy,
    ) -> Self {
        self.push(Arc::new(step), Some(retry), Some(compensation_retry))
    }

    /// Appends an already shared step.
    pub fn shared_step(self, step: Arc<dyn SagaStep<C>>) -> Self {
        self.push(step, None, None)
    }

    /// Sets the default forward retry policy.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets a compensation policy distinct from the forward one.
    pub fn compensation_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.compensation_retry = Some(retry);
        self
    }

    fn push(
        mut self,
        step: Arc<dyn SagaStep<C>>,
        retry: Option<RetryPolicy>,
        compensation_retry: Option<RetryPolicy>,
    ) -> Self {
        self.steps.push(StepEntry {
            step,
            retry,
            compensation_retry,
        });
        self
    }

    /// Validates and builds the definition.
    ///
    /// Fails if the name is blank, a step name is blank, or two steps share
    /// a name.
    pub fn build(self) -> Result<SagaDefinition<C>> {
        if self.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga name must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.steps {
            let name = entry.step.name();
            if name.trim().is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' has a step with an empty name",
                    self.name
                )));
            }
            if !seen.insert(name) {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' has duplicate step '{name}'",
                    self.name
                )));
            }
        }

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
            retry: self.retry,
            compensation_retry: self.compensation_retry,
        })
    }
}

/// Definitions known to an executor, keyed by name.
///
/// Filled at startup and handed to the executor, which never changes it.
pub struct DefinitionRegistry<C: SagaContext> {
    definitions: HashMap<String, Arc<SagaDefinition<C>>>,
}

impl<C: SagaContext> DefinitionRegistry<C> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Registers a definition under its name.
    pub fn register(&mut self, definition: SagaDefinition<C>) -> Result<()> {
        if self.definitions.contains_key(definition.name()) {
            return Err(SagaError::DuplicateDefinition(definition.name().to_string()));
        }
        self.definitions
            .insert(definition.name().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Registers a definition, builder style.
    pub fn with(mut self, definition: SagaDefinition<C>) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    /// Looks up a definition by name.
    pub fn get(&self, name: &str) -> Result<Arc<SagaDefinition<C>>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::DefinitionNotFound(name.to_string()))
    }

    /// Returns the registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<C: SagaContext> Default for DefinitionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
