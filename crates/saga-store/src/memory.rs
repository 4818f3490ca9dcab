use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    InstanceQuery, Result, SagaId, SagaInstance, SagaSnapshot, SagaStepRecord, StoreError, Version,
    store::{SagaPersistence, validate_instance_for_save, validate_record_for_append},
};

/// In-memory saga store for tests and single-process deployments.
///
/// Provides the same guarantees as the PostgreSQL implementation: saves
/// are version-checked and atomic, records get strictly increasing
/// sequence numbers per instance.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
    records: Arc<RwLock<HashMap<SagaId, Vec<SagaStepRecord>>>>,
    snapshots: Arc<RwLock<HashMap<SagaId, SagaSnapshot>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored instances.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Returns the number of records stored for an instance.
    pub async fn record_count(&self, saga_id: SagaId) -> usize {
        self.records
            .read()
            .await
            .get(&saga_id)
            .map_or(0, Vec::len)
    }

    /// Clears all instances, records and snapshots.
    pub async fn clear(&self) {
        self.instances.write().await.clear();
        self.records.write().await.clear();
        self.snapshots.write().await.clear();
    }
}

#[async_trait]
impl SagaPersistence for InMemorySagaStore {
    async fn save(&self, instance: &SagaInstance) -> Result<Version> {
        validate_instance_for_save(instance)?;

        let mut instances = self.instances.write().await;

        let current_version = instances
            .get(&instance.id)
            .map_or(Version::initial(), |stored| stored.version);

        if current_version != instance.version {
            return Err(StoreError::Conflict {
                saga_id: instance.id,
                expected: instance.version,
                actual: current_version,
            });
        }

        let new_version = current_version.next();
        let mut stored = instance.clone();
        stored.version = new_version;
        stored.updated_at = Utc::now();
        instances.insert(stored.id, stored);

        Ok(new_version)
    }

    async fn append_step_record(&self, mut record: SagaStepRecord) -> Result<u64> {
        validate_record_for_append(&record)?;

        if !self.instances.read().await.contains_key(&record.saga_id) {
            return Err(StoreError::NotFound(record.saga_id));
        }

        let mut records = self.records.write().await;
        let history = records.entry(record.saga_id).or_default();
        let sequence = history.last().map_or(1, |last| last.sequence + 1);
        record.sequence = sequence;
        history.push(record);

        Ok(sequence)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<(SagaInstance, Vec<SagaStepRecord>)>> {
        let instances = self.instances.read().await;
        let Some(instance) = instances.get(&saga_id).cloned() else {
            return Ok(None);
        };
        let records = self
            .records
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .unwrap_or_default();
        Ok(Some((instance, records)))
    }

    async fn get_instance(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        Ok(self.instances.read().await.get(&saga_id).cloned())
    }

    async fn records_after(
        &self,
        saga_id: SagaId,
        after_sequence: u64,
    ) -> Result<Vec<SagaStepRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&saga_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|r| r.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: SagaSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.get(&snapshot.saga_id) {
            Some(existing) if !snapshot.supersedes(existing) => {
                tracing::debug!(
                    saga_id = %snapshot.saga_id,
                    last_sequence = snapshot.last_sequence,
                    "ignoring stale snapshot"
                );
            }
            _ => {
                snapshots.insert(snapshot.saga_id, snapshot);
            }
        }
        Ok(())
    }

    async fn get_snapshot(&self, saga_id: SagaId) -> Result<Option<SagaSnapshot>> {
        Ok(self.snapshots.read().await.get(&saga_id).cloned())
    }

    async fn list(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let instances = self.instances.read().await;
        let mut matching: Vec<_> = instances
            .values()
            .filter(|instance| query.matches(instance))
            .cloned()
            .collect();

        // Sort by creation time then id
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let offset = query.offset.unwrap_or(0);
        let matching = matching.into_iter().skip(offset);

        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}
