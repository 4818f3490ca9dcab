//! The persisted form of one saga execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaContext, SagaId, SagaStatus, StoreError, Version};

/// Structured detail about why an instance stopped short of completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// The step whose failure drove the instance off the happy path.
    pub step_name: Option<String>,
    /// Human-readable error message.
    pub message: String,
    /// True if the failure happened while compensating.
    pub during_compensation: bool,
}

impl FailureDetail {
    pub fn forward(step_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_name: Some(step_name.into()),
            message: message.into(),
            during_compensation: false,
        }
    }

    pub fn compensation(step_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_name: Some(step_name.into()),
            message: message.into(),
            during_compensation: true,
        }
    }

    /// A failure not tied to a step (unknown definition, inconsistent state).
    pub fn instance(message: impl Into<String>) -> Self {
        Self {
            step_name: None,
            message: message.into(),
            during_compensation: false,
        }
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.step_name, self.during_compensation) {
            (Some(step), true) => write!(f, "compensation of '{step}' failed: {}", self.message),
            (Some(step), false) => write!(f, "step '{step}' failed: {}", self.message),
            (None, _) => write!(f, "{}", self.message),
        }
    }
}

/// One execution of a saga definition.
///
/// `version` is the version the instance was loaded at (0 for a new
/// instance). A save succeeds only if the stored version still matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: SagaId,
    pub definition_name: String,
    pub status: SagaStatus,
    /// Next forward step to run, or the number of steps once all completed.
    pub current_step_index: usize,
    pub context: SagaContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
    /// Absolute saga deadline, if the definition carries a timeout.
    pub deadline: Option<DateTime<Utc>>,
    pub failure: Option<FailureDetail>,
}

impl SagaInstance {
    /// Creates a new, unsaved instance in `Pending`.
    pub fn new(definition_name: impl Into<String>, context: SagaContext) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            definition_name: definition_name.into(),
            status: SagaStatus::Pending,
            current_step_index: 0,
            context,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
            deadline: None,
            failure: None,
        }
    }

    /// Moves the instance to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: SagaStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::Invalid(format!(
                "saga {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the saga deadline has passed.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
