use async_trait::async_trait;

use crate::{
    InstanceQuery, Result, SagaId, SagaInstance, SagaSnapshot, SagaStepRecord, StoreError, Version,
};

/// Core trait for saga persistence implementations.
///
/// Implementations must be thread-safe (Send + Sync) and guarantee that a
/// save observing a version conflict writes nothing, and that reads reflect
/// the last successful save.
#[async_trait]
pub trait SagaPersistence: Send + Sync {
    /// Saves an instance with optimistic concurrency.
    ///
    /// `instance.version` must equal the stored version (0 for an instance
    /// that has never been saved). Fails with `Conflict` otherwise.
    ///
    /// Returns the new version.
    async fn save(&self, instance: &SagaInstance) -> Result<Version>;

    /// Appends a step record to the instance's history.
    ///
    /// The store assigns the next sequence number and returns it.
    async fn append_step_record(&self, record: SagaStepRecord) -> Result<u64>;

    /// Loads an instance together with its full history, oldest record first.
    ///
    /// Returns None if the instance doesn't exist.
    async fn load(&self, saga_id: SagaId) -> Result<Option<(SagaInstance, Vec<SagaStepRecord>)>>;

    /// Loads only the instance row.
    async fn get_instance(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Retrieves the records with a sequence greater than `after_sequence`.
    ///
    /// Useful when replaying from a snapshot.
    async fn records_after(
        &self,
        saga_id: SagaId,
        after_sequence: u64,
    ) -> Result<Vec<SagaStepRecord>>;

    /// Saves a snapshot, replacing an older one for the same instance.
    ///
    /// A snapshot that covers less history than the stored one is ignored.
    async fn save_snapshot(&self, snapshot: SagaSnapshot) -> Result<()>;

    /// Retrieves the latest snapshot for an instance.
    async fn get_snapshot(&self, saga_id: SagaId) -> Result<Option<SagaSnapshot>>;

    /// Lists instances matching a query, oldest first.
    async fn list(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>>;

    /// Lists every non-terminal instance, for recovery scans.
    async fn list_active(&self) -> Result<Vec<SagaInstance>> {
        self.list(InstanceQuery::active()).await
    }
}

/// The pieces recovery needs to rebuild an instance's progress.
#[derive(Debug, Clone)]
pub struct StoredHistory {
    pub instance: SagaInstance,
    /// Latest snapshot, if one was taken.
    pub snapshot: Option<SagaSnapshot>,
    /// Records after the snapshot, or the full history without one.
    pub records: Vec<SagaStepRecord>,
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaPersistenceExt: SagaPersistence {
    /// Checks if an instance exists.
    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.get_instance(saga_id).await?.is_some())
    }

    /// Loads an instance, failing with `NotFound` if it doesn't exist.
    async fn require_instance(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.get_instance(saga_id)
            .await?
            .ok_or(StoreError::NotFound(saga_id))
    }

    /// Loads an instance for replay, starting from its snapshot if one exists.
    async fn load_for_replay(&self, saga_id: SagaId) -> Result<Option<StoredHistory>> {
        let Some(instance) = self.get_instance(saga_id).await? else {
            return Ok(None);
        };

        if let Some(snapshot) = self.get_snapshot(saga_id).await? {
            let records = self.records_after(saga_id, snapshot.last_sequence).await?;
            Ok(Some(StoredHistory {
                instance,
                snapshot: Some(snapshot),
                records,
            }))
        } else {
            let records = self.records_after(saga_id, 0).await?;
            Ok(Some(StoredHistory {
                instance,
                snapshot: None,
                records,
            }))
        }
    }
}

// Blanket implementation for all SagaPersistence implementations
impl<T: SagaPersistence + ?Sized> SagaPersistenceExt for T {}

/// Validates an instance before it is written.
pub fn validate_instance_for_save(instance: &SagaInstance) -> Result<()> {
    if instance.definition_name.trim().is_empty() {
        return Err(StoreError::Invalid(
            "instance has an empty definition name".to_string(),
        ));
    }
    if instance.version < Version::initial() {
        return Err(StoreError::Invalid(format!(
            "instance has a negative version {}",
            instance.version
        )));
    }
    Ok(())
}

/// Validates a record before it is appended.
pub fn validate_record_for_append(record: &SagaStepRecord) -> Result<()> {
    if record.step_name.trim().is_empty() {
        return Err(StoreError::Invalid(
            "step record has an empty step name".to_string(),
        ));
    }
    if record.attempt == 0 {
        return Err(StoreError::Invalid(
            "step record attempt numbers start at 1".to_string(),
        ));
    }
    if let Some(finished_at) = record.finished_at
        && finished_at < record.started_at
    {
        return Err(StoreError::Invalid(format!(
            "step '{}' finished before it started",
            record.step_name
        )));
    }
    Ok(())
}
