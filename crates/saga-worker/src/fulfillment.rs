//! The order fulfillment saga: reserve stock, charge the customer, ship.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ContextError, SagaContext};
use saga::{
    RetryPolicy, SagaDefinition, SagaRegistry, SagaStep, StepContext, StepError, StepOutput,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::services::{
    InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService, InventoryService,
    PaymentService, ReservationItem, ShippingService,
};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

/// Input of an order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<ReservationItem>,
    pub amount_cents: u64,
}

impl OrderRequest {
    /// Converts the request into the initial saga context.
    pub fn into_context(self) -> Result<SagaContext, ContextError> {
        SagaContext::from_json(serde_json::to_value(self)?)
    }
}

/// The services the fulfillment steps call.
#[derive(Clone)]
pub struct FulfillmentServices {
    pub inventory: Arc<dyn InventoryService>,
    pub payment: Arc<dyn PaymentService>,
    pub shipping: Arc<dyn ShippingService>,
}

impl FulfillmentServices {
    /// Services backed by the in-memory implementations.
    pub fn in_memory(
        inventory: InMemoryInventoryService,
        payment: InMemoryPaymentService,
        shipping: InMemoryShippingService,
    ) -> Self {
        Self {
            inventory: Arc::new(inventory),
            payment: Arc::new(payment),
            shipping: Arc::new(shipping),
        }
    }
}

fn service_failure(error: impl std::fmt::Display) -> StepError {
    StepError::execution(error.to_string())
}

/// Reserves the order's items. Writes `reservation_id`.
pub struct ReserveInventory {
    inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl SagaStep for ReserveInventory {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn forward(&self, _ctx: &StepContext, data: &SagaContext) -> Result<StepOutput, StepError> {
        let order_id: String = data.require("order_id")?;
        let items: Vec<ReservationItem> = data.get("items")?.unwrap_or_default();

        let reservation_id = self
            .inventory
            .reserve(&order_id, &items)
            .await
            .map_err(service_failure)?;
        tracing::debug!(%order_id, %reservation_id, "inventory reserved");
        Ok(StepOutput::empty().set("reservation_id", json!(reservation_id)))
    }

    async fn compensate(&self, _ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        let Some(reservation_id) = data.get::<String>("reservation_id")? else {
            return Ok(());
        };
        self.inventory
            .release(&reservation_id)
            .await
            .map_err(service_failure)
    }
}

/// Charges the customer. Writes `payment_id`.
pub struct ProcessPayment {
    payment: Arc<dyn PaymentService>,
}

#[async_trait]
impl SagaStep for ProcessPayment {
    fn name(&self) -> &str {
        STEP_PROCESS_PAYMENT
    }

    async fn forward(&self, _ctx: &StepContext, data: &SagaContext) -> Result<StepOutput, StepError> {
        let order_id: String = data.require("order_id")?;
        let customer_id: String = data.require("customer_id")?;
        let amount_cents: u64 = data.require("amount_cents")?;

        let payment_id = self
            .payment
            .charge(&order_id, &customer_id, amount_cents)
            .await
            .map_err(service_failure)?;
        tracing::debug!(%order_id, %payment_id, amount_cents, "payment charged");
        Ok(StepOutput::empty().set("payment_id", json!(payment_id)))
    }

    async fn compensate(&self, _ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        let Some(payment_id) = data.get::<String>("payment_id")? else {
            return Ok(());
        };
        self.payment
            .refund(&payment_id)
            .await
            .map_err(service_failure)
    }
}

/// Creates the shipment. Writes `tracking_number`.
pub struct CreateShipment {
    shipping: Arc<dyn ShippingService>,
}

#[async_trait]
impl SagaStep for CreateShipment {
    fn name(&self) -> &str {
        STEP_CREATE_SHIPMENT
    }

    async fn forward(&self, _ctx: &StepContext, data: &SagaContext) -> Result<StepOutput, StepError> {
        let order_id: String = data.require("order_id")?;

        let tracking_number = self
            .shipping
            .create_shipment(&order_id)
            .await
            .map_err(service_failure)?;
        tracing::debug!(%order_id, %tracking_number, "shipment created");
        Ok(StepOutput::empty().set("tracking_number", json!(tracking_number)))
    }

    async fn compensate(&self, _ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        let Some(tracking_number) = data.get::<String>("tracking_number")? else {
            return Ok(());
        };
        self.shipping
            .cancel_shipment(&tracking_number)
            .await
            .map_err(service_failure)
    }
}

/// Builds the order fulfillment definition on top of `services`.
pub fn order_fulfillment(services: &FulfillmentServices) -> Result<SagaDefinition, ValidationError> {
    SagaDefinition::builder(SAGA_TYPE)
        .step(ReserveInventory {
            inventory: services.inventory.clone(),
        })
        .retry(RetryPolicy::exponential(
            3,
            Duration::from_millis(100),
            Duration::from_secs(2),
        ))
        .timeout(Duration::from_secs(10))
        .step(ProcessPayment {
            payment: services.payment.clone(),
        })
        .retry(RetryPolicy::simple(2, Duration::from_millis(500)))
        .timeout(Duration::from_secs(10))
        .step(CreateShipment {
            shipping: services.shipping.clone(),
        })
        .retry(
            RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(5))
                .with_jitter(),
        )
        .timeout(Duration::from_secs(10))
        .saga_timeout(Duration::from_secs(300))
        .build()
}

/// Registry with every definition the worker runs.
pub fn registry(services: &FulfillmentServices) -> Result<SagaRegistry, ValidationError> {
    SagaRegistry::new().with(order_fulfillment(services)?)
}
