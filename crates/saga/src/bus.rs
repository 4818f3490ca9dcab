//! Command and event bus interfaces with in-memory implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

/// Subscription key that receives every published event.
pub const WILDCARD: &str = "*";

/// Errors raised by bus implementations and handlers.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No handler registered for command '{0}'")]
    NoHandler(String),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// A request for some participant to do work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub correlation_id: CorrelationId,
    pub saga_id: SagaId,
    pub payload: Value,
}

/// A fact published on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    /// Set on replies to a command.
    pub correlation_id: Option<CorrelationId>,
    pub saga_id: Option<SagaId>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            saga_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Creates a reply to `command`, carrying its correlation id.
    pub fn reply_to(command: &Command, event_type: impl Into<String>, payload: Value) -> Self {
        Self::new(event_type, payload)
            .with_saga(command.saga_id)
            .with_correlation(command.correlation_id)
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<(), BusError>;
}

/// Dispatches commands to whoever handles them.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn send(&self, command: Command) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), BusError>;
}

/// Publishes events to subscribers.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Subscribes `handler` to `event_type`, or to everything with [`WILDCARD`].
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>);
}

#[async_trait]
impl<T: EventBus + ?Sized> EventBus for Arc<T> {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        (**self).publish(event).await
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        (**self).subscribe(event_type, handler).await
    }
}

/// Routes commands by name to one registered handler.
#[derive(Clone, Default)]
pub struct InMemoryCommandBus {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn CommandHandler>>>>,
    sent: Arc<RwLock<Vec<Command>>>,
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for a command name, replacing any previous one.
    pub async fn register(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.write().await.insert(command.into(), handler);
    }

    /// Returns every command sent so far, in order.
    pub async fn sent(&self) -> Vec<Command> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl CommandBus for InMemoryCommandBus {
    async fn send(&self, command: Command) -> Result<(), BusError> {
        self.sent.write().await.push(command.clone());

        let handler = self.handlers.read().await.get(&command.name).cloned();
        match handler {
            Some(handler) => handler.handle(command).await,
            None => Err(BusError::NoHandler(command.name)),
        }
    }
}

/// Delivers events to subscribers and keeps a log of everything published.
///
/// Handler failures are logged and do not fail the publish.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>>,
    published: Arc<RwLock<Vec<Event>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every published event, in order.
    pub async fn published(&self) -> Vec<Event> {
        self.published.read().await.clone()
    }

    /// Returns the published events for one saga.
    pub async fn published_for(&self, saga_id: SagaId) -> Vec<Event> {
        self.published
            .read()
            .await
            .iter()
            .filter(|e| e.saga_id == Some(saga_id))
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.published.write().await.clear();
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.published.write().await.push(event.clone());

        // Handlers may publish in turn, so no lock is held while they run
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().await;
            [event.event_type.as_str(), WILDCARD]
                .iter()
                .filter_map(|key| handlers.get(*key))
                .flatten()
                .cloned()
                .collect()
        };

        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    error = %e,
                    "event handler failed"
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }
}
