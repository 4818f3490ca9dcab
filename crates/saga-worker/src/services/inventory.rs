//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order and returns the reservation ID.
    ///
    /// Reserving twice for the same order returns the existing reservation.
    async fn reserve(&self, order_id: &str, items: &[ReservationItem])
    -> Result<String, ServiceError>;

    /// Releases a reservation. Releasing an unknown reservation is a no-op.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    /// reservation ID -> (order ID, items)
    reservations: HashMap<String, (String, Vec<ReservationItem>)>,
    next_id: u32,
    fail_on_reserve: bool,
}

/// In-memory inventory service for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following reserve call fail.
    pub async fn set_fail_on_reserve(&self, fail: bool) {
        self.state.write().await.fail_on_reserve = fail;
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    pub async fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state
            .read()
            .await
            .reservations
            .contains_key(reservation_id)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: &str,
        items: &[ReservationItem],
    ) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;

        if state.fail_on_reserve {
            return Err(ServiceError::Inventory("Insufficient stock".to_string()));
        }
        if let Some(existing) = state
            .reservations
            .iter()
            .find(|(_, (order, _))| order == order_id)
            .map(|(id, _)| id.clone())
        {
            return Ok(existing);
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items.to_vec()));
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        self.state.write().await.reservations.remove(reservation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widgets() -> Vec<ReservationItem> {
        vec![ReservationItem {
            sku: "SKU-001".to_string(),
            quantity: 2,
        }]
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();

        let reservation_id = service.reserve("order-1", &widgets()).await.unwrap();
        assert!(reservation_id.starts_with("RES-"));
        assert_eq!(service.reservation_count().await, 1);
        assert!(service.has_reservation(&reservation_id).await);

        service.release(&reservation_id).await.unwrap();
        service.release(&reservation_id).await.unwrap();
        assert_eq!(service.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_fail_on_reserve() {
        let service = InMemoryInventoryService::new();
        service.set_fail_on_reserve(true).await;

        let result = service.reserve("order-1", &widgets()).await;
        assert!(matches!(result, Err(ServiceError::Inventory(_))));
        assert_eq!(service.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_order() {
        let service = InMemoryInventoryService::new();

        let first = service.reserve("order-1", &widgets()).await.unwrap();
        let again = service.reserve("order-1", &widgets()).await.unwrap();
        let other = service.reserve("order-2", &widgets()).await.unwrap();

        assert_eq!(first, "RES-0001");
        assert_eq!(again, first);
        assert_eq!(other, "RES-0002");
    }
}
