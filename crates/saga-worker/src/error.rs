//! Worker error types.

use common::ContextError;
use saga::{SagaError, ValidationError};
use saga_store::StoreError;
use thiserror::Error;

/// Errors returned by the fulfillment services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Inventory service error: {0}")]
    Inventory(String),

    #[error("Payment service error: {0}")]
    Payment(String),

    #[error("Shipping service error: {0}")]
    Shipping(String),
}

/// Errors that stop the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Invalid saga definition: {0}")]
    Definition(#[from] ValidationError),

    #[error("Invalid saga input: {0}")]
    Context(#[from] ContextError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}
