use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{CorrelationId, SagaContext};
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

use super::{PayloadFn, SagaStep, StepContext, StepOutput};
use crate::bus::{BusError, Command, CommandBus, Event, EventBus, EventHandler};
use crate::error::StepError;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands reply events to the command step waiting on their correlation id.
///
/// Subscribe it to every reply event type with [`CorrelationRouter::attach`].
/// Replies nobody waits for are dropped.
#[derive(Default)]
pub struct CorrelationRouter {
    waiters: Mutex<HashMap<CorrelationId, oneshot::Sender<Event>>>,
}

impl CorrelationRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes the router to the given reply event types.
    pub async fn attach<B: EventBus + ?Sized>(self: &Arc<Self>, bus: &B, event_types: &[&str]) {
        for event_type in event_types {
            bus.subscribe(event_type, self.clone()).await;
        }
    }

    /// Registers interest in the reply for `correlation_id`.
    pub async fn register(&self, correlation_id: CorrelationId) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(correlation_id, tx);
        rx
    }

    /// Drops interest in a reply that will no longer be awaited.
    pub async fn forget(&self, correlation_id: CorrelationId) {
        self.waiters.lock().await.remove(&correlation_id);
    }

    /// Number of replies still awaited.
    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for CorrelationRouter {
    async fn handle(&self, event: &Event) -> Result<(), BusError> {
        let Some(correlation_id) = event.correlation_id else {
            return Ok(());
        };
        if let Some(waiter) = self.waiters.lock().await.remove(&correlation_id) {
            // The waiter may have given up already
            let _ = waiter.send(event.clone());
        }
        Ok(())
    }
}

/// Sends a command and waits for its correlated success or failure event.
///
/// Fields of the success payload become context keys. A failure event, the
/// reply timeout or cancellation fail the step.
pub struct CommandStep {
    name: String,
    command: String,
    success_event: String,
    failure_event: String,
    compensation: Option<String>,
    reply_timeout: Duration,
    payload: Option<PayloadFn>,
    bus: Arc<dyn CommandBus>,
    router: Arc<CorrelationRouter>,
}

impl CommandStep {
    /// Creates a step sending `command`, expecting `<command>Succeeded` or
    /// `<command>Failed` in reply.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        bus: Arc<dyn CommandBus>,
        router: Arc<CorrelationRouter>,
    ) -> Self {
        let command = command.into();
        Self {
            name: name.into(),
            success_event: format!("{command}Succeeded"),
            failure_event: format!("{command}Failed"),
            command,
            compensation: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            payload: None,
            bus,
            router,
        }
    }

    /// Overrides the reply event types.
    pub fn replies(mut self, success: impl Into<String>, failure: impl Into<String>) -> Self {
        self.success_event = success.into();
        self.failure_event = failure.into();
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Builds the command payload from the context instead of sending all of it.
    pub fn payload(mut self, payload: impl Fn(&SagaContext) -> Value + Send + Sync + 'static) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Command sent, without awaiting a reply, when the step is compensated.
    pub fn compensate_with(mut self, command: impl Into<String>) -> Self {
        self.compensation = Some(command.into());
        self
    }

    pub fn success_event(&self) -> &str {
        &self.success_event
    }

    pub fn failure_event(&self) -> &str {
        &self.failure_event
    }

    fn build_payload(&self, data: &SagaContext) -> Value {
        match &self.payload {
            Some(payload) => payload(data),
            None => data.to_json(),
        }
    }

    fn interpret(&self, reply: Event) -> Result<StepOutput, StepError> {
        if reply.event_type == self.success_event {
            let data = SagaContext::from_json(reply.payload)?;
            return Ok(StepOutput::with_data(data));
        }

        let reason = reply
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| reply.payload.to_string());
        Err(StepError::execution(format!(
            "{} replied {}: {}",
            self.command, reply.event_type, reason
        )))
    }
}

#[async_trait]
impl SagaStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(
        &self,
        ctx: &StepContext,
        data: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        let correlation_id = CorrelationId::new();
        // Registered before sending so a synchronous reply is not missed
        let reply = self.router.register(correlation_id).await;

        let command = Command {
            name: self.command.clone(),
            correlation_id,
            saga_id: ctx.saga_id,
            payload: self.build_payload(data),
        };
        tracing::debug!(
            saga_id = %ctx.saga_id,
            step = %self.name,
            command = %self.command,
            %correlation_id,
            "sending command"
        );
        if let Err(e) = self.bus.send(command).await {
            self.router.forget(correlation_id).await;
            return Err(StepError::execution(e.to_string()));
        }

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            received = tokio::time::timeout(self.reply_timeout, reply) => match received {
                Ok(Ok(event)) => return self.interpret(event),
                Ok(Err(_)) => Err(StepError::execution("reply channel closed")),
                Err(_) => Err(StepError::Timeout(self.reply_timeout)),
            },
        };

        self.router.forget(correlation_id).await;
        outcome
    }

    async fn compensate(&self, ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        let Some(compensation) = &self.compensation else {
            return Ok(());
        };

        let command = Command {
            name: compensation.clone(),
            correlation_id: CorrelationId::new(),
            saga_id: ctx.saga_id,
            payload: data.to_json(),
        };
        self.bus
            .send(command)
            .await
            .map_err(|e| StepError::execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CommandHandler, InMemoryCommandBus, InMemoryEventBus};
    use common::SagaId;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    /// Replies to `Reserve` with success, or failure if the payload says so.
    struct Warehouse {
        events: InMemoryEventBus,
    }

    #[async_trait]
    impl CommandHandler for Warehouse {
        async fn handle(&self, command: Command) -> Result<(), BusError> {
            let reply = if command.payload.get("sku") == Some(&json!("missing")) {
                Event::reply_to(&command, "ReserveFailed", json!({"reason": "out of stock"}))
            } else {
                Event::reply_to(&command, "ReserveSucceeded", json!({"reservation_id": "R-1"}))
            };
            self.events.publish(reply).await
        }
    }

    struct Silent;

    #[async_trait]
    impl CommandHandler for Silent {
        async fn handle(&self, _command: Command) -> Result<(), BusError> {
            Ok(())
        }
    }

    async fn setup(handler: Arc<dyn CommandHandler>) -> (CommandStep, Arc<CorrelationRouter>) {
        let events = InMemoryEventBus::new();
        let commands = InMemoryCommandBus::new();
        commands.register("Reserve", handler).await;
        let router = CorrelationRouter::new();
        router
            .attach(&events, &["ReserveSucceeded", "ReserveFailed"])
            .await;
        let step = CommandStep::new("reserve", "Reserve", Arc::new(commands), router.clone());
        (step, router)
    }

    fn step_ctx() -> StepContext {
        StepContext::new(SagaId::new(), "reserve", 1, CancellationToken::new())
    }

    #[tokio::test]
    async fn success_payload_becomes_output() {
        let events = InMemoryEventBus::new();
        let commands = InMemoryCommandBus::new();
        commands
            .register("Reserve", Arc::new(Warehouse { events: events.clone() }))
            .await;
        let router = CorrelationRouter::new();
        router
            .attach(&events, &["ReserveSucceeded", "ReserveFailed"])
            .await;
        let step = CommandStep::new("reserve", "Reserve", Arc::new(commands), router.clone());

        let output = step
            .forward(&step_ctx(), &SagaContext::new().with("sku", json!("A-1")))
            .await
            .unwrap();

        assert_eq!(output.data.get_value("reservation_id"), Some(&json!("R-1")));
        assert_eq!(router.pending().await, 0);
    }

    #[tokio::test]
    async fn failure_event_fails_the_step() {
        let events = InMemoryEventBus::new();
        let commands = InMemoryCommandBus::new();
        commands
            .register("Reserve", Arc::new(Warehouse { events: events.clone() }))
            .await;
        let router = CorrelationRouter::new();
        router
            .attach(&events, &["ReserveSucceeded", "ReserveFailed"])
            .await;
        let step = CommandStep::new("reserve", "Reserve", Arc::new(commands), router);

        let err = step
            .forward(&step_ctx(), &SagaContext::new().with("sku", json!("missing")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of stock"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_times_out() {
        let (step, router) = setup(Arc::new(Silent)).await;
        let step = step.reply_timeout(Duration::from_millis(200));

        let err = step.forward(&step_ctx(), &SagaContext::new()).await.unwrap_err();
        assert!(matches!(err, StepError::Timeout(d) if d == Duration::from_millis(200)));
        assert_eq!(router.pending().await, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let (step, router) = setup(Arc::new(Silent)).await;
        let ctx = step_ctx();
        ctx.cancel.cancel();

        let err = step.forward(&ctx, &SagaContext::new()).await.unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert_eq!(router.pending().await, 0);
    }

    #[tokio::test]
    async fn compensation_sends_undo_command() {
        let commands = InMemoryCommandBus::new();
        commands.register("Release", Arc::new(Silent)).await;
        let step = CommandStep::new(
            "reserve",
            "Reserve",
            Arc::new(commands.clone()),
            CorrelationRouter::new(),
        )
        .compensate_with("Release");

        step.compensate(&step_ctx(), &SagaContext::new()).await.unwrap();

        let sent = commands.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "Release");
    }
}
