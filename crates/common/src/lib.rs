//! Shared types for the saga orchestration workspace.

pub mod context;
pub mod types;

pub use context::{ContextError, SagaContext};
pub use types::{CorrelationId, SagaId};
