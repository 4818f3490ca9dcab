//! Declarative, validated saga definitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::SagaContext;

use crate::error::ValidationError;
use crate::retry::RetryPolicy;
use crate::step::{ConditionalStep, JoinPolicy, ParallelStep, SagaStep};

/// A step together with how the orchestrator runs it.
#[derive(Clone)]
pub struct StepDefinition {
    pub step: Arc<dyn SagaStep>,
    pub retry: RetryPolicy,
    /// Per-attempt time limit. Falls back to the orchestrator default.
    pub timeout: Option<Duration>,
    /// The step name and the names of any sub-steps.
    names: Vec<String>,
}

impl StepDefinition {
    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Names of the sub-steps of a parallel group.
    pub fn sub_step_names(&self) -> &[String] {
        self.names.get(1..).unwrap_or(&[])
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// An immutable, ordered list of steps.
///
/// Only [`SagaDefinitionBuilder::build`] creates one, so every definition
/// has at least one step, unique step names and valid retry policies.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    saga_timeout: Option<Duration>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            saga_timeout: None,
            pending_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of the step with the given name.
    pub fn index_of(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == step_name)
    }

    /// Time budget for the whole saga, measured from its start.
    pub fn saga_timeout(&self) -> Option<Duration> {
        self.saga_timeout
    }
}

/// Builder for [`SagaDefinition`].
///
/// `.retry()` and `.timeout()` configure the most recently added step.
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    saga_timeout: Option<Duration>,
    /// First misuse seen while building, reported by `build()`.
    pending_error: Option<ValidationError>,
}

impl SagaDefinitionBuilder {
    /// Appends a step.
    pub fn step(self, step: impl SagaStep + 'static) -> Self {
        self.step_arc(Arc::new(step))
    }

    /// Appends a shared step.
    pub fn step_arc(mut self, step: Arc<dyn SagaStep>) -> Self {
        let names = vec![step.name().to_string()];
        self.steps.push(StepDefinition {
            step,
            retry: RetryPolicy::NoRetry,
            timeout: None,
            names,
        });
        self
    }

    /// Appends a step that only runs when `predicate` holds.
    pub fn step_if(
        self,
        predicate: impl Fn(&SagaContext) -> bool + Send + Sync + 'static,
        step: impl SagaStep + 'static,
    ) -> Self {
        self.step(ConditionalStep::new(predicate, Arc::new(step)))
    }

    /// Appends a group of sub-steps run concurrently.
    pub fn parallel(
        mut self,
        name: impl Into<String>,
        policy: JoinPolicy,
        steps: Vec<Arc<dyn SagaStep>>,
    ) -> Self {
        let name = name.into();
        if steps.is_empty() {
            self.record_error(ValidationError::EmptyParallelGroup(name.clone()));
        }
        let mut names = vec![name.clone()];
        names.extend(steps.iter().map(|s| s.name().to_string()));
        self.steps.push(StepDefinition {
            step: Arc::new(ParallelStep::new(name, policy, steps)),
            retry: RetryPolicy::NoRetry,
            timeout: None,
            names,
        });
        self
    }

    /// Sets the retry policy of the last added step.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        match self.steps.last_mut() {
            Some(last) => last.retry = policy,
            None => self.note_misuse("retry"),
        }
        self
    }

    /// Sets the per-attempt timeout of the last added step.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        match self.steps.last_mut() {
            Some(last) => last.timeout = Some(timeout),
            None => self.note_misuse("timeout"),
        }
        self
    }

    /// Sets the time budget of the whole saga.
    pub fn saga_timeout(mut self, timeout: Duration) -> Self {
        self.saga_timeout = Some(timeout);
        self
    }

    fn note_misuse(&mut self, method: &'static str) {
        self.record_error(ValidationError::NoStepToConfigure(method));
    }

    fn record_error(&mut self, error: ValidationError) {
        self.pending_error.get_or_insert(error);
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<SagaDefinition, ValidationError> {
        if let Some(error) = self.pending_error {
            return Err(error);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps(self.name));
        }
        if self.saga_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ValidationError::ZeroSagaTimeout(self.name));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            for name in &step.names {
                if name.trim().is_empty() {
                    return Err(ValidationError::EmptyStepName);
                }
                if !seen.insert(name.as_str()) {
                    return Err(ValidationError::DuplicateStep(name.clone()));
                }
            }
            step.retry
                .validate()
                .map_err(|reason| ValidationError::InvalidRetryPolicy {
                    step: step.name().to_string(),
                    reason,
                })?;
            if step.timeout.is_some_and(|t| t.is_zero()) {
                return Err(ValidationError::ZeroTimeout(step.name().to_string()));
            }
        }

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
            saga_timeout: self.saga_timeout,
        })
    }
}
