use std::sync::Arc;

use async_trait::async_trait;
use common::SagaContext;
use serde_json::Value;

use super::{PayloadFn, SagaStep, StepContext, StepOutput};
use crate::bus::{Event, EventBus};
use crate::error::StepError;

/// Publishes a domain event without waiting for any reply.
///
/// The payload is the whole context unless a payload function is set.
/// Compensation publishes the undo event, if one is configured.
pub struct EventStep {
    name: String,
    event_type: String,
    undo_event: Option<String>,
    payload: Option<PayloadFn>,
    bus: Arc<dyn EventBus>,
}

impl EventStep {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            undo_event: None,
            payload: None,
            bus,
        }
    }

    pub fn undo_with(mut self, event_type: impl Into<String>) -> Self {
        self.undo_event = Some(event_type.into());
        self
    }

    pub fn payload(
        mut self,
        payload: impl Fn(&SagaContext) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    async fn publish(
        &self,
        ctx: &StepContext,
        event_type: &str,
        data: &SagaContext,
    ) -> Result<(), StepError> {
        let payload = match &self.payload {
            Some(payload) => payload(data),
            None => data.to_json(),
        };
        self.bus
            .publish(Event::new(event_type, payload).with_saga(ctx.saga_id))
            .await
            .map_err(|e| StepError::execution(e.to_string()))
    }
}

#[async_trait]
impl SagaStep for EventStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(
        &self,
        ctx: &StepContext,
        data: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        self.publish(ctx, &self.event_type, data).await?;
        Ok(StepOutput::empty())
    }

    async fn compensate(&self, ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        match &self.undo_event {
            Some(undo) => self.publish(ctx, undo, data).await,
            None => Ok(()),
        }
    }
}
