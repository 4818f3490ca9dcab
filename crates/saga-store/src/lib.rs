//! Persistence for saga instances.
//!
//! A saga instance is stored as a version-checked row plus an append-only
//! history of step records. Snapshots compact the history so recovery only
//! replays the records written after the latest snapshot.

pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod snapshot;
pub mod status;
pub mod store;

pub use common::{SagaContext, SagaId};
pub use error::{Result, StoreError};
pub use instance::{FailureDetail, SagaInstance};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::InstanceQuery;
pub use record::{SagaStepRecord, SagaStepRecordBuilder, StepPhase, StepStatus, Version};
pub use snapshot::SagaSnapshot;
pub use status::SagaStatus;
pub use store::{SagaPersistence, SagaPersistenceExt, StoredHistory};
