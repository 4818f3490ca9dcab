//! Saga orchestration engine.
//!
//! A saga is an ordered list of steps, each pairing a forward action with a
//! compensating action. The orchestrator runs the steps in order, retrying
//! them per their [`RetryPolicy`]. When a step gives up, it compensates the
//! completed steps in reverse order.
//!
//! Every transition is persisted through [`saga_store::SagaPersistence`]
//! before it is published on the [`EventBus`], so an instance interrupted
//! by a crash is resumed by replaying its history.
//!
//! ```text
//! SagaDefinition::builder("OrderFulfillment")
//!     .step(reserve).retry(RetryPolicy::exponential(3, 100ms, 2s))
//!     .step(charge)
//!     .step(ship)
//!     .build()?
//! ```

pub mod bus;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod step;

pub use bus::{
    BusError, Command, CommandBus, CommandHandler, Event, EventBus, EventHandler,
    InMemoryCommandBus, InMemoryEventBus,
};
pub use config::OrchestratorConfig;
pub use definition::{SagaDefinition, SagaDefinitionBuilder, StepDefinition};
pub use error::{Result, SagaError, StepError, ValidationError};
pub use events::{LIFECYCLE_EVENT_TYPES, SagaEvent};
pub use orchestrator::SagaOrchestrator;
pub use registry::SagaRegistry;
pub use replay::SagaProgress;
pub use retry::{RetryDecision, RetryPolicy};
pub use step::{
    CommandStep, ConditionalStep, CorrelationRouter, EventStep, InMemoryTransactionCoordinator,
    JoinPolicy, ParallelStep, SagaStep, StepContext, StepOutput, TransactionCoordinator,
    TransactionError, TransactionId, TransactionState, TwoPhaseCommitStep,
};
