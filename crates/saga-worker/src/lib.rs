//! Saga worker process.
//!
//! Runs the order fulfillment saga on a [`saga::SagaOrchestrator`],
//! resumes interrupted sagas at boot and on a fixed interval, and stops
//! the run-loops on shutdown so another process can recover them.

pub mod config;
pub mod error;
pub mod fulfillment;
pub mod services;
pub mod worker;

pub use config::{Config, LogFormat};
pub use error::{ServiceError, WorkerError};
pub use fulfillment::{FulfillmentServices, OrderRequest, SAGA_TYPE, order_fulfillment, registry};
pub use worker::{LifecycleLogger, Worker};
