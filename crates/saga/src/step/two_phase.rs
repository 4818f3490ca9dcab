use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{SagaContext, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{SagaStep, StepContext, StepOutput};
use crate::error::StepError;

/// Identifies one distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Derives the transaction id of a step within a saga.
    ///
    /// The same saga and step always map to the same id, so a compensation
    /// run after recovery addresses the transaction the forward run opened.
    pub fn for_step(saga_id: SagaId, step_name: &str) -> Self {
        Self(Uuid::new_v5(&saga_id.as_uuid(), step_name.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction {0} was rejected during prepare: {1}")]
    PrepareRejected(TransactionId, String),

    #[error("Transaction {0} failed to commit: {1}")]
    CommitFailed(TransactionId, String),

    #[error("Transaction {0} is not prepared")]
    NotPrepared(TransactionId),

    #[error("Transaction {0} failed to abort: {1}")]
    AbortFailed(TransactionId, String),
}

/// Coordinator of the prepare/commit/abort protocol.
///
/// `abort` must accept a transaction that was never prepared.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    async fn prepare(&self, id: TransactionId) -> Result<(), TransactionError>;
    async fn commit(&self, id: TransactionId) -> Result<(), TransactionError>;
    async fn abort(&self, id: TransactionId) -> Result<(), TransactionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    transactions: HashMap<TransactionId, TransactionState>,
    fail_on_prepare: bool,
    fail_on_commit: bool,
    aborts: usize,
}

/// In-memory coordinator with fault injection, for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionCoordinator {
    state: Arc<RwLock<CoordinatorState>>,
}

impl InMemoryTransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following prepare fail.
    pub async fn set_fail_on_prepare(&self, fail: bool) {
        self.state.write().await.fail_on_prepare = fail;
    }

    /// Makes every following commit fail.
    pub async fn set_fail_on_commit(&self, fail: bool) {
        self.state.write().await.fail_on_commit = fail;
    }

    pub async fn state_of(&self, id: TransactionId) -> Option<TransactionState> {
        self.state.read().await.transactions.get(&id).copied()
    }

    /// Number of abort calls received.
    pub async fn abort_count(&self) -> usize {
        self.state.read().await.aborts
    }
}

#[async_trait]
impl TransactionCoordinator for InMemoryTransactionCoordinator {
    async fn prepare(&self, id: TransactionId) -> Result<(), TransactionError> {
        let mut state = self.state.write().await;
        if state.fail_on_prepare {
            return Err(TransactionError::PrepareRejected(
                id,
                "participant voted no".to_string(),
            ));
        }
        state.transactions.insert(id, TransactionState::Prepared);
        Ok(())
    }

    async fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        let mut state = self.state.write().await;
        if state.transactions.get(&id) != Some(&TransactionState::Prepared) {
            return Err(TransactionError::NotPrepared(id));
        }
        if state.fail_on_commit {
            return Err(TransactionError::CommitFailed(
                id,
                "participant unavailable".to_string(),
            ));
        }
        state.transactions.insert(id, TransactionState::Committed);
        Ok(())
    }

    async fn abort(&self, id: TransactionId) -> Result<(), TransactionError> {
        let mut state = self.state.write().await;
        state.aborts += 1;
        state.transactions.insert(id, TransactionState::Aborted);
        Ok(())
    }
}

/// Runs prepare and commit on a transaction coordinator.
///
/// A failed prepare or commit aborts the transaction. Compensation aborts
/// (rolls back) it.
pub struct TwoPhaseCommitStep {
    name: String,
    coordinator: Arc<dyn TransactionCoordinator>,
}

impl TwoPhaseCommitStep {
    pub fn new(name: impl Into<String>, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        Self {
            name: name.into(),
            coordinator,
        }
    }

    /// Context key holding the transaction id after a successful commit.
    pub fn output_key(&self) -> String {
        format!("{}_transaction_id", self.name)
    }

    /// Aborts `id` after a failed forward run, logging a failed abort.
    async fn abort_quietly(&self, id: TransactionId) {
        if let Err(e) = self.coordinator.abort(id).await {
            tracing::warn!(
                transaction_id = %id,
                error = %e,
                "abort after failed two-phase commit also failed"
            );
        }
    }
}

#[async_trait]
impl SagaStep for TwoPhaseCommitStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(
        &self,
        ctx: &StepContext,
        _data: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        let id = TransactionId::for_step(ctx.saga_id, &self.name);

        if let Err(e) = self.coordinator.prepare(id).await {
            self.abort_quietly(id).await;
            return Err(StepError::execution(e.to_string()));
        }
        if ctx.is_cancelled() {
            self.abort_quietly(id).await;
            return Err(StepError::Cancelled);
        }
        if let Err(e) = self.coordinator.commit(id).await {
            self.abort_quietly(id).await;
            return Err(StepError::execution(e.to_string()));
        }

        Ok(StepOutput::empty().set(self.output_key(), json!(id.to_string())))
    }

    async fn compensate(&self, ctx: &StepContext, _data: &SagaContext) -> Result<(), StepError> {
        let id = TransactionId::for_step(ctx.saga_id, &self.name);
        self.coordinator
            .abort(id)
            .await
            .map_err(|e| StepError::execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (TwoPhaseCommitStep, InMemoryTransactionCoordinator, StepContext) {
        let coordinator = InMemoryTransactionCoordinator::new();
        let step = TwoPhaseCommitStep::new("ledger", Arc::new(coordinator.clone()));
        let ctx = StepContext::new(SagaId::new(), "ledger", 1, CancellationToken::new());
        (step, coordinator, ctx)
    }

    #[test]
    fn transaction_id_is_deterministic() {
        let saga_id = SagaId::new();
        assert_eq!(
            TransactionId::for_step(saga_id, "ledger"),
            TransactionId::for_step(saga_id, "ledger")
        );
        assert_ne!(
            TransactionId::for_step(saga_id, "ledger"),
            TransactionId::for_step(saga_id, "other")
        );
    }

    #[tokio::test]
    async fn prepare_and_commit() {
        let (step, coordinator, ctx) = setup();

        let output = step.forward(&ctx, &SagaContext::new()).await.unwrap();

        let id = TransactionId::for_step(ctx.saga_id, "ledger");
        assert_eq!(coordinator.state_of(id).await, Some(TransactionState::Committed));
        assert_eq!(
            output.data.get_value("ledger_transaction_id"),
            Some(&json!(id.to_string()))
        );
    }

    #[tokio::test]
    async fn failed_prepare_aborts() {
        let (step, coordinator, ctx) = setup();
        coordinator.set_fail_on_prepare(true).await;

        let err = step.forward(&ctx, &SagaContext::new()).await.unwrap_err();

        assert!(err.to_string().contains("voted no"));
        let id = TransactionId::for_step(ctx.saga_id, "ledger");
        assert_eq!(coordinator.state_of(id).await, Some(TransactionState::Aborted));
        assert_eq!(coordinator.abort_count().await, 1);
    }

    #[tokio::test]
    async fn failed_commit_aborts() {
        let (step, coordinator, ctx) = setup();
        coordinator.set_fail_on_commit(true).await;

        assert!(step.forward(&ctx, &SagaContext::new()).await.is_err());

        let id = TransactionId::for_step(ctx.saga_id, "ledger");
        assert_eq!(coordinator.state_of(id).await, Some(TransactionState::Aborted));
    }

    #[tokio::test]
    async fn compensation_rolls_back_and_tolerates_no_forward() {
        let (step, coordinator, ctx) = setup();

        // never prepared
        step.compensate(&ctx, &SagaContext::new()).await.unwrap();

        step.forward(&ctx, &SagaContext::new()).await.unwrap();
        step.compensate(&ctx, &SagaContext::new()).await.unwrap();

        let id = TransactionId::for_step(ctx.saga_id, "ledger");
        assert_eq!(coordinator.state_of(id).await, Some(TransactionState::Aborted));
        assert_eq!(coordinator.abort_count().await, 2);
    }
}
