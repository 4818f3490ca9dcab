//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order and returns its tracking number.
    async fn create_shipment(&self, order_id: &str) -> Result<String, ServiceError>;

    /// Cancels a shipment. Cancelling an unknown shipment is a no-op.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    /// tracking number -> order ID
    shipments: HashMap<String, String>,
    next_id: u32,
    /// Number of upcoming create calls that fail; `u32::MAX` fails forever.
    failures_left: u32,
}

/// In-memory shipping service for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following create call fail.
    pub async fn set_fail_on_create(&self, fail: bool) {
        self.state.write().await.failures_left = if fail { u32::MAX } else { 0 };
    }

    /// Makes only the next `times` create calls fail.
    pub async fn fail_next_creates(&self, times: u32) {
        self.state.write().await.failures_left = times;
    }

    /// Returns the number of active shipments.
    pub async fn shipment_count(&self) -> usize {
        self.state.read().await.shipments.len()
    }

    pub async fn has_shipment(&self, tracking_number: &str) -> bool {
        self.state
            .read()
            .await
            .shipments
            .contains_key(tracking_number)
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(&self, order_id: &str) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;

        if state.failures_left > 0 {
            if state.failures_left != u32::MAX {
                state.failures_left -= 1;
            }
            return Err(ServiceError::Shipping("Shipping unavailable".to_string()));
        }

        state.next_id += 1;
        let tracking_number = format!("TRACK-{:04}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), order_id.to_string());
        Ok(tracking_number)
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        self.state.write().await.shipments.remove(tracking_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_cancel_shipment() {
        let service = InMemoryShippingService::new();

        let tracking = service.create_shipment("order-1").await.unwrap();
        assert!(tracking.starts_with("TRACK-"));
        assert_eq!(service.shipment_count().await, 1);
        assert!(service.has_shipment(&tracking).await);

        service.cancel_shipment(&tracking).await.unwrap();
        assert_eq!(service.shipment_count().await, 0);
    }

    #[tokio::test]
    async fn test_fail_on_create() {
        let service = InMemoryShippingService::new();
        service.set_fail_on_create(true).await;

        for _ in 0..3 {
            assert!(service.create_shipment("order-1").await.is_err());
        }
        assert_eq!(service.shipment_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let service = InMemoryShippingService::new();
        service.fail_next_creates(2).await;

        assert!(service.create_shipment("order-1").await.is_err());
        assert!(service.create_shipment("order-1").await.is_err());
        assert_eq!(service.create_shipment("order-1").await.unwrap(), "TRACK-0001");
    }
}
