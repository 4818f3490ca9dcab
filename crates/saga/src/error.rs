//! Saga error types.

use std::time::Duration;

use common::{ContextError, SagaId};
use saga_store::{SagaStatus, StoreError, Version};
use thiserror::Error;

/// Errors returned by a single step attempt.
///
/// These never escape the orchestrator: they are recorded in the step
/// history and drive retries or compensation.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step's work failed. Retryable per the step's policy.
    #[error("Step execution failed: {0}")]
    Execution(String),

    /// The step did not finish within its time limit.
    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    /// The step was cancelled. Never retried.
    #[error("Step was cancelled")]
    Cancelled,

    /// The step failed and could not undo its own partial work. Never
    /// retried: the saga fails instead of compensating.
    #[error("Step failed and could not be unwound: {0}")]
    Compensation(String),

    /// The step read or produced context data it could not use.
    #[error("Step context error: {0}")]
    Context(#[from] ContextError),
}

impl StepError {
    /// Creates an execution error from a message.
    pub fn execution(message: impl Into<String>) -> Self {
        StepError::Execution(message.into())
    }

    /// Returns false for errors a retry cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Execution(_) | StepError::Timeout(_))
    }
}

/// Reasons a saga definition is rejected at build time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Saga definition name must not be empty")]
    EmptyName,

    #[error("Saga '{0}' has no steps")]
    NoSteps(String),

    #[error("Step names must not be empty")]
    EmptyStepName,

    #[error("Step name '{0}' is used more than once")]
    DuplicateStep(String),

    #[error("Parallel group '{0}' has no sub-steps")]
    EmptyParallelGroup(String),

    #[error("Invalid retry policy for step '{step}': {reason}")]
    InvalidRetryPolicy { step: String, reason: String },

    #[error("Step '{0}' has a zero timeout")]
    ZeroTimeout(String),

    #[error("Saga '{0}' has a zero saga timeout")]
    ZeroSagaTimeout(String),

    /// `.retry()` or `.timeout()` was called before any `.step()`.
    #[error("'{0}' must follow a step")]
    NoStepToConfigure(&'static str),

    #[error("Saga definition '{0}' is already registered")]
    DuplicateDefinition(String),
}

/// Errors that reach callers of the orchestrator.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Invalid saga definition: {0}")]
    Validation(#[from] ValidationError),

    /// Compensation of a step gave up; the instance is `Failed`.
    #[error("Compensation of step '{step}' failed: {reason}")]
    Compensation { step: String, reason: String },

    /// A save kept conflicting after the configured number of reloads.
    #[error("Persistence conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    PersistenceConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: String,
        actual: SagaStatus,
    },

    /// Another run-loop took over the instance.
    #[error("Saga {0} is owned by another run-loop")]
    OwnershipLost(SagaId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run-loop error: {0}")]
    RunLoop(String),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                saga_id,
                expected,
                actual,
            } => SagaError::PersistenceConflict {
                saga_id,
                expected,
                actual,
            },
            StoreError::NotFound(id) => SagaError::NotFound(id),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
