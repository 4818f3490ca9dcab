//! The step contract and the built-in step kinds.

mod command;
mod conditional;
mod event;
mod parallel;
mod two_phase;

pub use command::{CommandStep, CorrelationRouter};
pub use conditional::{ConditionalStep, Predicate};
pub use event::EventStep;
pub use parallel::{JoinPolicy, ParallelStep};
pub use two_phase::{
    InMemoryTransactionCoordinator, TransactionCoordinator, TransactionError, TransactionId,
    TransactionState, TwoPhaseCommitStep,
};

use std::sync::Arc;

use async_trait::async_trait;
use common::{SagaContext, SagaId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

/// Builds a message payload from the saga context.
pub type PayloadFn = Arc<dyn Fn(&SagaContext) -> Value + Send + Sync>;

/// Per-attempt information handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub step_name: String,
    /// Attempt number within the current phase, starting at 1.
    pub attempt: u32,
    /// Cancelled when the attempt should stop.
    pub cancel: CancellationToken,
    /// Set once the attempt has work that must be unwound before it ends.
    held: CancellationToken,
}

impl StepContext {
    pub fn new(
        saga_id: SagaId,
        step_name: impl Into<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            saga_id,
            step_name: step_name.into(),
            attempt,
            cancel,
            held: CancellationToken::new(),
        }
    }

    /// Context for a sub-step of this one, sharing the attempt number and
    /// the hold.
    pub fn for_sub_step(&self, step_name: &str, cancel: CancellationToken) -> Self {
        Self {
            held: self.held.clone(),
            ..Self::new(self.saga_id, step_name, self.attempt, cancel)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Keeps the attempt alive past a timeout or cancellation until it
    /// returns. Cancellation is still signalled.
    pub fn hold(&self) {
        self.held.cancel();
    }

    pub fn is_held(&self) -> bool {
        self.held.is_cancelled()
    }
}

/// What a successful forward attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Keys to merge into the saga context.
    pub data: SagaContext,
    /// Set when a conditional step decided not to run.
    pub skipped: bool,
}

impl StepOutput {
    /// Output with no context keys.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(data: SagaContext) -> Self {
        Self {
            data,
            skipped: false,
        }
    }

    pub fn skipped() -> Self {
        Self {
            data: SagaContext::new(),
            skipped: true,
        }
    }

    /// Builder-style insert of one context key.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.set(key, value);
        self
    }
}

/// One unit of work in a saga, with the action that undoes it.
///
/// `compensate` must be safe to call when `forward` never ran or only
/// partially ran, and calling it twice must not undo the work twice.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn forward(&self, ctx: &StepContext, data: &SagaContext)
    -> Result<StepOutput, StepError>;

    async fn compensate(&self, ctx: &StepContext, data: &SagaContext) -> Result<(), StepError>;
}
