//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// A charge held by the payment service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub order_id: String,
    pub customer_id: String,
    pub amount_cents: u64,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order and returns the payment ID.
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<String, ServiceError>;

    /// Refunds a payment. Refunding an unknown payment is a no-op.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, Payment>,
    refunded_cents: u64,
    next_id: u32,
    fail_on_charge: bool,
}

/// In-memory payment service for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following charge call fail.
    pub async fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().await.fail_on_charge = fail;
    }

    /// Returns the number of payments not refunded.
    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    pub async fn has_payment(&self, payment_id: &str) -> bool {
        self.state.read().await.payments.contains_key(payment_id)
    }

    /// Total amount refunded so far.
    pub async fn refunded_cents(&self) -> u64 {
        self.state.read().await.refunded_cents
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: &str,
        customer_id: &str,
        amount_cents: u64,
    ) -> Result<String, ServiceError> {
        let mut state = self.state.write().await;

        if state.fail_on_charge {
            return Err(ServiceError::Payment("Payment declined".to_string()));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            Payment {
                order_id: order_id.to_string(),
                customer_id: customer_id.to_string(),
                amount_cents,
            },
        );
        Ok(payment_id)
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        if let Some(payment) = state.payments.remove(payment_id) {
            state.refunded_cents += payment.amount_cents;
        }
        Ok(())
    }
}
