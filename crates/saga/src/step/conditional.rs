use std::sync::Arc;

use async_trait::async_trait;
use common::SagaContext;

use super::{SagaStep, StepContext, StepOutput};
use crate::error::StepError;

/// Decides from the context whether a conditional step runs.
pub type Predicate = Arc<dyn Fn(&SagaContext) -> bool + Send + Sync>;

/// Runs the wrapped step only when the predicate holds.
///
/// A skipped step is recorded as completed with `skipped` set and is never
/// compensated.
pub struct ConditionalStep {
    predicate: Predicate,
    inner: Arc<dyn SagaStep>,
}

impl ConditionalStep {
    pub fn new(
        predicate: impl Fn(&SagaContext) -> bool + Send + Sync + 'static,
        inner: Arc<dyn SagaStep>,
    ) -> Self {
        Self {
            predicate: Arc::new(predicate),
            inner,
        }
    }
}

#[async_trait]
impl SagaStep for ConditionalStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn forward(
        &self,
        ctx: &StepContext,
        data: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        if !(self.predicate)(data) {
            tracing::debug!(saga_id = %ctx.saga_id, step = %self.name(), "condition false, skipping");
            return Ok(StepOutput::skipped());
        }
        self.inner.forward(ctx, data).await
    }

    async fn compensate(&self, ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        self.inner.compensate(ctx, data).await
    }
}
