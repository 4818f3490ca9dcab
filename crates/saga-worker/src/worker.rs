//! The worker loop: recovery at boot, periodic recovery scans, shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use saga::bus::WILDCARD;
use saga::{
    BusError, Event, EventBus, EventHandler, InMemoryEventBus, OrchestratorConfig, SagaEvent,
    SagaOrchestrator, SagaRegistry,
};
use saga_store::SagaPersistence;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::WorkerError;
use crate::fulfillment::{OrderRequest, SAGA_TYPE};
use crate::services::ReservationItem;

/// Logs every lifecycle event published by the orchestrator.
pub struct LifecycleLogger;

#[async_trait]
impl EventHandler for LifecycleLogger {
    async fn handle(&self, event: &Event) -> Result<(), BusError> {
        match SagaEvent::from_bus_event(event) {
            Ok(lifecycle) => {
                tracing::info!(
                    saga_id = %lifecycle.saga_id(),
                    event_type = lifecycle.event_type(),
                    step = lifecycle.step_name().unwrap_or("-"),
                    "saga lifecycle event"
                );
                metrics::counter!("saga_lifecycle_events_total", "type" => lifecycle.event_type())
                    .increment(1);
            }
            Err(_) => {
                tracing::trace!(event_type = %event.event_type, "ignoring non-lifecycle event");
            }
        }
        Ok(())
    }
}

/// Owns the orchestrator of the worker process.
pub struct Worker<P: SagaPersistence + 'static> {
    orchestrator: SagaOrchestrator<P, Arc<InMemoryEventBus>>,
    events: Arc<InMemoryEventBus>,
}

impl<P: SagaPersistence + 'static> Clone for Worker<P> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            events: self.events.clone(),
        }
    }
}

impl<P: SagaPersistence + 'static> Worker<P> {
    pub async fn new(store: P, registry: SagaRegistry, config: OrchestratorConfig) -> Self {
        let events = Arc::new(InMemoryEventBus::new());
        events.subscribe(WILDCARD, Arc::new(LifecycleLogger)).await;
        Self {
            orchestrator: SagaOrchestrator::new(store, events.clone(), registry, config),
            events,
        }
    }

    pub fn orchestrator(&self) -> &SagaOrchestrator<P, Arc<InMemoryEventBus>> {
        &self.orchestrator
    }

    pub fn events(&self) -> &InMemoryEventBus {
        &self.events
    }

    /// Starts `count` order fulfillment sagas with generated orders.
    pub async fn start_demo_orders(&self, count: u32) -> Result<Vec<SagaId>, WorkerError> {
        let mut started = Vec::with_capacity(count as usize);
        for n in 1..=count {
            let request = OrderRequest {
                order_id: format!("demo-order-{n:04}"),
                customer_id: "demo-customer".to_string(),
                items: vec![ReservationItem {
                    sku: "SKU-DEMO".to_string(),
                    quantity: n,
                }],
                amount_cents: 1999 * u64::from(n),
            };
            let saga_id = self
                .orchestrator
                .start(SAGA_TYPE, request.into_context()?)
                .await?;
            started.push(saga_id);
        }
        if count > 0 {
            tracing::info!(count, "started demo orders");
        }
        Ok(started)
    }

    /// Recovers active sagas, then rescans every `recovery_interval` until
    /// `shutdown` resolves. Stops the run-loops before returning.
    pub async fn run(
        &self,
        recovery_interval: Option<Duration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), WorkerError> {
        self.orchestrator.recover().await?;

        tokio::pin!(shutdown);
        match recovery_interval {
            Some(period) => {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = &mut shutdown => break,
                        _ = ticker.tick() => self.scan().await,
                    }
                }
            }
            None => shutdown.await,
        }

        self.orchestrator.shutdown().await;
        Ok(())
    }

    async fn scan(&self) {
        match self.orchestrator.recover().await {
            Ok(0) => tracing::debug!("recovery scan found nothing to resume"),
            Ok(recovered) => tracing::info!(recovered, "recovery scan resumed sagas"),
            Err(e) => tracing::error!(error = %e, "recovery scan failed"),
        }
    }
}
