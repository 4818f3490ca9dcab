//! The saga orchestrator and its per-instance run-loops.
//!
//! Every instance is driven by one tokio task. The task persists a step
//! record before it publishes the matching lifecycle event, and saves the
//! instance row with a version check after every step, so a crashed
//! run-loop can be rebuilt from the store by [`SagaOrchestrator::recover`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{SagaContext, SagaId};
use saga_store::{
    FailureDetail, InstanceQuery, SagaInstance, SagaPersistence, SagaPersistenceExt, SagaSnapshot,
    SagaStatus, SagaStepRecord, SagaStepRecordBuilder, StepPhase, StepStatus, StoreError,
    StoredHistory, Version,
};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError, StepError};
use crate::events::SagaEvent;
use crate::registry::SagaRegistry;
use crate::replay::SagaProgress;
use crate::retry::RetryDecision;
use crate::step::StepContext;

/// Starts, tracks and recovers saga instances.
///
/// Cloning is cheap; clones share the same run-loops.
pub struct SagaOrchestrator<P, E>
where
    P: SagaPersistence + 'static,
    E: EventBus + 'static,
{
    inner: Arc<Inner<P, E>>,
}

impl<P, E> Clone for SagaOrchestrator<P, E>
where
    P: SagaPersistence + 'static,
    E: EventBus + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<P, E> {
    store: P,
    bus: E,
    registry: Arc<SagaRegistry>,
    config: OrchestratorConfig,
    /// Live run-loops. An entry exists from spawn until the task exits.
    running: Mutex<HashMap<SagaId, RunHandle>>,
    shutdown: CancellationToken,
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunExit>>,
}

/// How a run-loop task ended.
#[derive(Debug, Clone)]
enum RunExit {
    /// Reached a terminal status, or stopped by shutdown.
    Finished,
    Conflict { expected: Version, actual: Version },
    OwnershipLost,
    Error(String),
}

impl<P, E> SagaOrchestrator<P, E>
where
    P: SagaPersistence + 'static,
    E: EventBus + 'static,
{
    pub fn new(
        store: P,
        bus: E,
        registry: impl Into<Arc<SagaRegistry>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                registry: registry.into(),
                config,
                running: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &P {
        &self.inner.store
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.inner.registry
    }

    /// Persists a new instance of the named definition and spawns its run-loop.
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, definition_name: &str, context: SagaContext) -> Result<SagaId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SagaError::RunLoop("orchestrator is shut down".to_string()));
        }
        let definition = self
            .inner
            .registry
            .get(definition_name)
            .ok_or_else(|| SagaError::UnknownDefinition(definition_name.to_string()))?;

        let mut instance = SagaInstance::new(definition.name(), context);
        instance.deadline = definition
            .saga_timeout()
            .or(self.inner.config.saga_timeout)
            .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
            .and_then(|timeout| instance.created_at.checked_add_signed(timeout));
        let saga_id = instance.id;

        self.inner.store.save(&instance).await?;
        metrics::counter!("saga_started_total", "definition" => definition.name().to_string())
            .increment(1);
        tracing::info!(%saga_id, "saga created");

        let mut running = self.inner.running.lock().await;
        self.spawn_locked(&mut running, saga_id, CancellationToken::new());
        Ok(saga_id)
    }

    /// Starts an instance and waits for its run-loop to stop.
    ///
    /// A compensation that gave up is returned as [`SagaError::Compensation`];
    /// the instance is then `Failed` in the store.
    pub async fn execute(&self, definition_name: &str, context: SagaContext) -> Result<SagaInstance> {
        let saga_id = self.start(definition_name, context).await?;
        let instance = self.wait(saga_id).await?;
        match instance.failure {
            Some(ref failure) if instance.status == SagaStatus::Failed && failure.during_compensation => {
                Err(SagaError::Compensation {
                    step: failure.step_name.clone().unwrap_or_default(),
                    reason: failure.message.clone(),
                })
            }
            _ => Ok(instance),
        }
    }

    /// Waits until the instance has no live run-loop, then returns it.
    pub async fn wait(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let done = self
            .inner
            .running
            .lock()
            .await
            .get(&saga_id)
            .map(|handle| handle.done.clone());

        if let Some(mut done) = done {
            let exit = match done.wait_for(Option::is_some).await {
                Ok(exit) => exit.clone(),
                Err(_) => Some(RunExit::Error("run-loop ended without reporting".to_string())),
            };
            match exit {
                Some(RunExit::Conflict { expected, actual }) => {
                    return Err(SagaError::PersistenceConflict {
                        saga_id,
                        expected,
                        actual,
                    });
                }
                Some(RunExit::OwnershipLost) => return Err(SagaError::OwnershipLost(saga_id)),
                Some(RunExit::Error(message)) => return Err(SagaError::RunLoop(message)),
                Some(RunExit::Finished) | None => {}
            }
        }

        self.status(saga_id).await
    }

    /// Reads the instance from the store.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaInstance> {
        Ok(self.inner.store.require_instance(saga_id).await?)
    }

    /// Every step record of the instance, oldest first.
    pub async fn history(&self, saga_id: SagaId) -> Result<Vec<SagaStepRecord>> {
        let (_, records) = self
            .inner
            .store
            .load(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        Ok(records)
    }

    pub async fn list(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        Ok(self.inner.store.list(query).await?)
    }

    /// Fails the running step and compensates the instance.
    ///
    /// An active instance without a live run-loop is taken over and
    /// compensated. Terminal instances are rejected.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, saga_id: SagaId) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if let Some(handle) = running.get(&saga_id) {
            handle.cancel.cancel();
            tracing::info!("cancellation requested");
            return Ok(());
        }

        let instance = self.inner.store.require_instance(saga_id).await?;
        if instance.is_terminal() {
            return Err(SagaError::InvalidState {
                expected: "an active saga".to_string(),
                actual: instance.status,
            });
        }
        self.ensure_not_shut_down()?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        self.spawn_locked(&mut running, saga_id, cancel);
        tracing::info!("took over saga to cancel it");
        Ok(())
    }

    /// Spawns a run-loop for an active instance that has none.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, saga_id: SagaId) -> Result<()> {
        let mut running = self.inner.running.lock().await;
        if running.contains_key(&saga_id) {
            return Ok(());
        }

        let instance = self.inner.store.require_instance(saga_id).await?;
        if instance.is_terminal() {
            return Err(SagaError::InvalidState {
                expected: "an active saga".to_string(),
                actual: instance.status,
            });
        }
        self.ensure_not_shut_down()?;

        self.spawn_locked(&mut running, saga_id, CancellationToken::new());
        Ok(())
    }

    /// Resumes every active instance in the store without a live run-loop.
    ///
    /// Returns how many run-loops were spawned.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        self.ensure_not_shut_down()?;
        let active = self.inner.store.list_active().await?;

        let mut running = self.inner.running.lock().await;
        let mut recovered = 0;
        for instance in active {
            if running.contains_key(&instance.id) {
                continue;
            }
            self.spawn_locked(&mut running, instance.id, CancellationToken::new());
            recovered += 1;
        }

        if recovered > 0 {
            metrics::counter!("saga_recovered_total").increment(recovered as u64);
            tracing::info!(recovered, "recovered active sagas");
        }
        Ok(recovered)
    }

    pub async fn is_running(&self, saga_id: SagaId) -> bool {
        self.inner.running.lock().await.contains_key(&saga_id)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Stops every run-loop at its next suspension point and waits for them.
    ///
    /// Stopped instances stay active in the store; `recover()` on a new
    /// orchestrator continues them.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let pending: Vec<_> = self
            .inner
            .running
            .lock()
            .await
            .values()
            .map(|handle| handle.done.clone())
            .collect();

        tracing::info!(run_loops = pending.len(), "shutting down orchestrator");
        for mut done in pending {
            let _ = done.wait_for(Option::is_some).await;
        }
    }

    fn ensure_not_shut_down(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SagaError::RunLoop("orchestrator is shut down".to_string()));
        }
        Ok(())
    }

    fn spawn_locked(
        &self,
        running: &mut HashMap<SagaId, RunHandle>,
        saga_id: SagaId,
        cancel: CancellationToken,
    ) {
        let (done_tx, done_rx) = watch::channel(None);
        running.insert(
            saga_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            let exit = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!(%saga_id, "run-loop stopped by shutdown");
                    RunExit::Finished
                }
                result = Run::drive_instance(inner.clone(), saga_id, cancel) => match result {
                    Ok(status) => {
                        tracing::info!(%saga_id, %status, "run-loop finished");
                        RunExit::Finished
                    }
                    Err(SagaError::PersistenceConflict { expected, actual, .. }) => {
                        tracing::error!(%saga_id, %expected, %actual, "run-loop gave up on version conflicts");
                        RunExit::Conflict { expected, actual }
                    }
                    Err(SagaError::OwnershipLost(_)) => {
                        tracing::warn!(%saga_id, "run-loop lost ownership, stopping");
                        RunExit::OwnershipLost
                    }
                    Err(e) => {
                        tracing::error!(%saga_id, error = %e, "run-loop failed");
                        RunExit::Error(e.to_string())
                    }
                },
            };

            inner.running.lock().await.remove(&saga_id);
            done_tx.send_replace(Some(exit));
        });
    }
}

/// State of one run-loop.
struct Run<P, E> {
    inner: Arc<Inner<P, E>>,
    definition: Arc<SagaDefinition>,
    instance: SagaInstance,
    progress: SagaProgress,
    cancel: CancellationToken,
    deadline_at: Option<Instant>,
    saga_budget: Duration,
    /// Status and step index of the last successful save.
    saved: (SagaStatus, usize),
    records_since_snapshot: u64,
    /// Step that failed and could not undo its own partial work.
    unresolved: Option<(String, String)>,
}

impl<P, E> Run<P, E>
where
    P: SagaPersistence + 'static,
    E: EventBus + 'static,
{
    #[tracing::instrument(name = "saga_run", skip(inner, cancel))]
    async fn drive_instance(
        inner: Arc<Inner<P, E>>,
        saga_id: SagaId,
        cancel: CancellationToken,
    ) -> Result<SagaStatus> {
        let StoredHistory {
            instance,
            snapshot,
            records,
        } = inner
            .store
            .load_for_replay(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if instance.is_terminal() {
            return Ok(instance.status);
        }

        let Some(definition) = inner.registry.get(&instance.definition_name) else {
            let message = format!("unknown saga definition '{}'", instance.definition_name);
            return fail_unrunnable(&inner, instance, message).await;
        };

        let (base, records) = match snapshot.map(SagaSnapshot::into_state::<SagaProgress>) {
            Some(Ok(progress)) => (progress, records),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "unreadable snapshot, replaying full history");
                let records = inner.store.records_after(saga_id, 0).await?;
                (SagaProgress::new(instance.context.unowned()), records)
            }
            None => (SagaProgress::new(instance.context.unowned()), records),
        };
        let progress = match base.replay(&records) {
            Ok(progress) => progress,
            Err(e) => {
                let message = format!("history replay failed: {e}");
                return fail_unrunnable(&inner, instance, message).await;
            }
        };
        if let Err(message) = check_position(&definition, &progress) {
            return fail_unrunnable(&inner, instance, message).await;
        }

        let remaining = instance
            .deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        let saga_budget = instance
            .deadline
            .and_then(|deadline| (deadline - instance.created_at).to_std().ok())
            .unwrap_or_default();

        let run = Run {
            saved: (instance.status, instance.current_step_index),
            inner,
            definition,
            instance,
            progress,
            cancel,
            deadline_at: remaining.map(|r| Instant::now() + r),
            saga_budget,
            records_since_snapshot: 0,
            unresolved: None,
        };
        run.drive().await
    }

    async fn drive(mut self) -> Result<SagaStatus> {
        let saga_id = self.instance.id;
        if self.instance.status == SagaStatus::Pending {
            self.instance.transition(SagaStatus::Running)?;
            self.claim().await?;
            self.publish(SagaEvent::saga_started(saga_id, self.definition.name()))
                .await;
            tracing::info!(definition = %self.definition.name(), "saga started");
        } else {
            self.claim().await?;
            tracing::info!(
                status = %self.instance.status,
                next_step = self.progress.next_step,
                "resuming saga"
            );
        }

        if self.instance.status == SagaStatus::Running && self.run_forward().await? {
            return self.complete().await;
        }
        if let Some((step, error)) = self.unresolved.take() {
            return self.fail_compensation(&step, error).await;
        }
        self.compensate_all().await
    }

    /// Runs the remaining forward steps. Returns false once the saga
    /// entered compensation or a step left work it could not undo.
    async fn run_forward(&mut self) -> Result<bool> {
        while self.progress.next_step < self.definition.len() {
            let index = self.progress.next_step;
            let Some(step) = self.definition.step(index).cloned() else {
                break;
            };

            // Retry budget exhausted before a crash
            if let Some(failure) = self.progress.forward_failure.clone()
                && failure.index == index
                && failure.attempt >= step.retry.max_attempts()
            {
                self.give_up_forward(index, &failure.name, failure.attempt, failure.error)
                    .await?;
                return Ok(false);
            }

            if !self.run_step(index, &step).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs one step under its retry policy. Returns false if it gave up.
    async fn run_step(&mut self, index: usize, step: &StepDefinition) -> Result<bool> {
        let saga_id = self.instance.id;
        let name = step.name().to_string();

        loop {
            let attempt = self.progress.next_forward_attempt(index);

            if let Some(reason) = self.stop_reason() {
                let error = reason.to_string();
                let failed = self
                    .record(index, &name, StepPhase::Forward, StepStatus::Failed, attempt)
                    .finished()
                    .error(&error);
                self.append(failed).await?;
                self.give_up_forward(index, &name, attempt, error).await?;
                return Ok(false);
            }

            let started_at = Utc::now();
            let started = self
                .record(index, &name, StepPhase::Forward, StepStatus::Running, attempt)
                .started_at(started_at);
            self.append(started).await?;
            self.publish(SagaEvent::step_started(saga_id, &name, index, attempt))
                .await;
            metrics::counter!("saga_step_attempts_total").increment(1);
            tracing::debug!(step = %name, attempt, "step attempt started");

            let attempt_cancel = self.cancel.child_token();
            let ctx = StepContext::new(saga_id, name.clone(), attempt, attempt_cancel.clone());
            let until = self.attempt_deadline(step.timeout.or(self.inner.config.step_timeout));
            let result = run_bounded(
                step.step.forward(&ctx, &self.progress.context),
                until,
                &self.cancel,
                &attempt_cancel,
                &ctx,
                self.inner.config.cancellation_grace,
            )
            .await
            .and_then(|output| {
                self.progress.context.check_merge(&name, &output.data)?;
                Ok(output)
            });

            let error = match result {
                Ok(output) => {
                    let completed = self
                        .record(index, &name, StepPhase::Forward, StepStatus::Completed, attempt)
                        .started_at(started_at)
                        .finished()
                        .skipped(output.skipped)
                        .output(output.data);
                    self.append(completed).await?;
                    self.instance.current_step_index = self.progress.next_step;
                    self.instance.context = self.progress.context.clone();
                    self.persist().await?;
                    self.publish(SagaEvent::step_completed(
                        saga_id,
                        &name,
                        index,
                        attempt,
                        output.skipped,
                    ))
                    .await;
                    tracing::info!(step = %name, attempt, skipped = output.skipped, "step completed");
                    return Ok(true);
                }
                Err(error) => error,
            };

            let failed = self
                .record(index, &name, StepPhase::Forward, StepStatus::Failed, attempt)
                .started_at(started_at)
                .finished()
                .error(error.to_string());
            self.append(failed).await?;

            if let StepError::Compensation(message) = error {
                tracing::error!(step = %name, attempt, error = %message, "step could not undo its partial work");
                self.publish(SagaEvent::step_failed(saga_id, &name, index, attempt, &message))
                    .await;
                self.unresolved = Some((name, message));
                return Ok(false);
            }

            let decision = if self.deadline_passed() {
                RetryDecision::GiveUp
            } else {
                step.retry.decide(attempt, &error)
            };
            match decision {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(step = %name, attempt, error = %error, ?delay, "step failed, retrying");
                    metrics::counter!("saga_step_retries_total").increment(1);
                    if !self.backoff(delay).await {
                        self.give_up_forward(index, &name, attempt, error.to_string())
                            .await?;
                        return Ok(false);
                    }
                }
                RetryDecision::GiveUp => {
                    self.give_up_forward(index, &name, attempt, error.to_string())
                        .await?;
                    return Ok(false);
                }
            }
        }
    }

    async fn give_up_forward(
        &mut self,
        index: usize,
        name: &str,
        attempt: u32,
        error: String,
    ) -> Result<()> {
        let saga_id = self.instance.id;
        tracing::warn!(step = %name, attempt, %error, "step failed, compensating");
        self.publish(SagaEvent::step_failed(saga_id, name, index, attempt, &error))
            .await;

        self.instance.failure = Some(FailureDetail::forward(name, &error));
        self.instance.transition(SagaStatus::Compensating)?;
        self.persist().await?;
        self.publish(SagaEvent::saga_compensating(saga_id, name, error))
            .await;
        Ok(())
    }

    async fn complete(mut self) -> Result<SagaStatus> {
        self.instance.current_step_index = self.progress.next_step;
        self.instance.context = self.progress.context.clone();
        self.instance.transition(SagaStatus::Completed)?;
        self.persist().await?;
        self.publish(SagaEvent::saga_completed(self.instance.id))
            .await;

        metrics::counter!("saga_completed_total", "definition" => self.definition.name().to_string())
            .increment(1);
        self.record_duration();
        tracing::info!("saga completed");
        Ok(SagaStatus::Completed)
    }

    /// Compensates every completed step in reverse order.
    async fn compensate_all(mut self) -> Result<SagaStatus> {
        if let Some(failure) = self.progress.compensation_failure.clone() {
            let max_attempts = self
                .definition
                .step(failure.index)
                .map_or(1, |step| step.retry.max_attempts());
            if failure.attempt >= max_attempts && !self.progress.compensated.contains(&failure.index)
            {
                return self.fail_compensation(&failure.name, failure.error).await;
            }
        }

        for entry in self.progress.compensation_queue() {
            let step = self.definition.step(entry.index).cloned().ok_or_else(|| {
                SagaError::RunLoop(format!("no step at index {}", entry.index))
            })?;
            if let Some(error) = self.compensate_step(entry.index, &step).await? {
                return self.fail_compensation(step.name(), error).await;
            }
        }

        self.instance.transition(SagaStatus::Compensated)?;
        self.persist().await?;
        self.publish(SagaEvent::saga_compensated(self.instance.id))
            .await;

        metrics::counter!("saga_compensated_total", "definition" => self.definition.name().to_string())
            .increment(1);
        self.record_duration();
        tracing::info!("saga compensated");
        Ok(SagaStatus::Compensated)
    }

    /// Compensates one step under its retry policy.
    ///
    /// Neither cancellation nor the saga deadline interrupts compensation.
    /// Returns the last error if the step gave up.
    async fn compensate_step(
        &mut self,
        index: usize,
        step: &StepDefinition,
    ) -> Result<Option<String>> {
        let saga_id = self.instance.id;
        let name = step.name().to_string();
        let timeout = step.timeout.unwrap_or(self.inner.config.compensation_timeout);

        loop {
            let attempt = self.progress.next_compensation_attempt(index);
            let started_at = Utc::now();
            let started = self
                .record(
                    index,
                    &name,
                    StepPhase::Compensation,
                    StepStatus::Compensating,
                    attempt,
                )
                .started_at(started_at);
            self.append(started).await?;
            self.publish(SagaEvent::step_compensating(saga_id, &name, index, attempt))
                .await;

            let attempt_cancel = CancellationToken::new();
            let ctx = StepContext::new(saga_id, name.clone(), attempt, attempt_cancel.clone());
            let result = match tokio::time::timeout(
                timeout,
                step.step.compensate(&ctx, &self.progress.context),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    attempt_cancel.cancel();
                    Err(StepError::Timeout(timeout))
                }
            };

            let error = match result {
                Ok(()) => {
                    let compensated = self
                        .record(
                            index,
                            &name,
                            StepPhase::Compensation,
                            StepStatus::Compensated,
                            attempt,
                        )
                        .started_at(started_at)
                        .finished();
                    self.append(compensated).await?;
                    self.publish(SagaEvent::step_compensated(saga_id, &name, index, attempt))
                        .await;
                    tracing::info!(step = %name, attempt, "step compensated");
                    return Ok(None);
                }
                Err(error) => error,
            };

            let failed = self
                .record(
                    index,
                    &name,
                    StepPhase::Compensation,
                    StepStatus::Failed,
                    attempt,
                )
                .started_at(started_at)
                .finished()
                .error(error.to_string());
            self.append(failed).await?;

            match step.retry.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(step = %name, attempt, error = %error, ?delay, "compensation failed, retrying");
                    metrics::counter!("saga_step_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Ok(Some(error.to_string())),
            }
        }
    }

    async fn fail_compensation(mut self, name: &str, error: String) -> Result<SagaStatus> {
        tracing::error!(step = %name, %error, "compensation gave up, saga failed");
        self.instance.failure = Some(FailureDetail::compensation(name, &error));
        self.instance.transition(SagaStatus::Failed)?;
        self.persist().await?;
        self.publish(SagaEvent::saga_failed(
            self.instance.id,
            Some(name.to_string()),
            error,
            true,
        ))
        .await;

        metrics::counter!("saga_failed_total", "definition" => self.definition.name().to_string())
            .increment(1);
        self.record_duration();
        Ok(SagaStatus::Failed)
    }

    fn record(
        &self,
        index: usize,
        name: &str,
        phase: StepPhase,
        status: StepStatus,
        attempt: u32,
    ) -> SagaStepRecordBuilder {
        SagaStepRecord::builder()
            .saga_id(self.instance.id)
            .step(index, name)
            .phase(phase)
            .status(status)
            .attempt(attempt)
    }

    /// Appends a record, folds it into the progress and snapshots when due.
    async fn append(&mut self, builder: SagaStepRecordBuilder) -> Result<()> {
        let mut record = builder.build()?;
        record.sequence = self.inner.store.append_step_record(record.clone()).await?;
        self.progress
            .apply(&record)
            .map_err(|e| SagaError::RunLoop(format!("cannot apply step record: {e}")))?;

        self.records_since_snapshot += 1;
        let interval = self.inner.config.snapshot_interval;
        if interval > 0 && self.records_since_snapshot >= interval {
            self.snapshot().await;
        }
        Ok(())
    }

    async fn snapshot(&mut self) {
        self.records_since_snapshot = 0;
        let snapshot = match SagaSnapshot::from_state(
            self.instance.id,
            self.instance.version,
            self.progress.last_sequence,
            &self.progress,
        ) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize snapshot");
                return;
            }
        };
        match self.inner.store.save_snapshot(snapshot).await {
            Ok(()) => tracing::debug!(last_sequence = self.progress.last_sequence, "snapshot saved"),
            Err(e) => tracing::warn!(error = %e, "failed to save snapshot"),
        }
    }

    /// First save of a run-loop. Any conflict means another run-loop owns
    /// the instance.
    async fn claim(&mut self) -> Result<()> {
        match self.inner.store.save(&self.instance).await {
            Ok(version) => {
                self.instance.version = version;
                self.saved = (self.instance.status, self.instance.current_step_index);
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => Err(SagaError::OwnershipLost(self.instance.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the instance, reloading after a version conflict.
    ///
    /// The reload adopts the stored version only if nothing else advanced
    /// the instance since our last save.
    async fn persist(&mut self) -> Result<()> {
        let saga_id = self.instance.id;
        let mut reloads = 0;
        loop {
            let (expected, actual) = match self.inner.store.save(&self.instance).await {
                Ok(version) => {
                    self.instance.version = version;
                    self.saved = (self.instance.status, self.instance.current_step_index);
                    return Ok(());
                }
                Err(StoreError::Conflict {
                    expected, actual, ..
                }) => (expected, actual),
                Err(e) => return Err(e.into()),
            };

            if reloads >= self.inner.config.max_conflict_retries {
                return Err(SagaError::PersistenceConflict {
                    saga_id,
                    expected,
                    actual,
                });
            }
            reloads += 1;
            tracing::warn!(%expected, %actual, reloads, "version conflict, reloading");

            let stored = self.inner.store.require_instance(saga_id).await?;
            let foreign_records = !self
                .inner
                .store
                .records_after(saga_id, self.progress.last_sequence)
                .await?
                .is_empty();
            if stored.is_terminal()
                || (stored.status, stored.current_step_index) != self.saved
                || foreign_records
            {
                return Err(SagaError::OwnershipLost(saga_id));
            }
            self.instance.version = stored.version;
        }
    }

    async fn publish(&self, event: SagaEvent) {
        publish(&self.inner.bus, event).await;
    }

    fn attempt_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        let step_deadline = timeout.map(|timeout| Instant::now() + timeout);
        match (step_deadline, self.deadline_at) {
            (Some(step), Some(saga)) => Some(step.min(saga)),
            (step, saga) => step.or(saga),
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Why the next forward attempt must not start, if anything.
    fn stop_reason(&self) -> Option<StepError> {
        if self.cancel.is_cancelled() {
            Some(StepError::Cancelled)
        } else if self.deadline_passed() {
            Some(StepError::Timeout(self.saga_budget))
        } else {
            None
        }
    }

    /// Sleeps between attempts. Returns false if cancelled or out of time.
    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
            () = sleep_until(self.deadline_at) => false,
        }
    }

    fn record_duration(&self) {
        let elapsed = (Utc::now() - self.instance.created_at)
            .to_std()
            .unwrap_or_default();
        metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
    }
}

/// Runs a step attempt until it finishes, `until` passes or `stop` fires.
///
/// On timeout or stop the attempt token is cancelled and the attempt gets
/// `grace` to wind down. A success within the grace period is kept. A held
/// attempt is awaited to the end, and a failure to unwind is reported as is.
async fn run_bounded<T, F>(
    attempt: F,
    until: Option<Instant>,
    stop: &CancellationToken,
    attempt_cancel: &CancellationToken,
    ctx: &StepContext,
    grace: Duration,
) -> std::result::Result<T, StepError>
where
    F: Future<Output = std::result::Result<T, StepError>>,
{
    let started = Instant::now();
    tokio::pin!(attempt);

    let reason = tokio::select! {
        biased;
        result = &mut attempt => return result,
        () = stop.cancelled() => StepError::Cancelled,
        () = sleep_until(until) => {
            StepError::Timeout(until.map_or(Duration::ZERO, |at| at.saturating_duration_since(started)))
        }
    };

    attempt_cancel.cancel();
    let result = match tokio::time::timeout(grace, &mut attempt).await {
        Ok(result) => result,
        Err(_) if ctx.is_held() => {
            tracing::debug!(step = %ctx.step_name, "attempt is held, waiting for it to unwind");
            attempt.await
        }
        Err(_) => return Err(reason),
    };
    match result {
        Ok(value) => Ok(value),
        Err(error @ StepError::Compensation(_)) => Err(error),
        Err(_) => Err(reason),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn publish<E: EventBus>(bus: &E, event: SagaEvent) {
    let event_type = event.event_type();
    let bus_event = match event.to_bus_event() {
        Ok(bus_event) => bus_event,
        Err(e) => {
            tracing::warn!(event_type, error = %e, "failed to encode lifecycle event");
            return;
        }
    };
    if let Err(e) = bus.publish(bus_event).await {
        tracing::warn!(event_type, error = %e, "failed to publish lifecycle event");
    }
}

/// Checks that replayed progress fits the definition.
fn check_position(
    definition: &SagaDefinition,
    progress: &SagaProgress,
) -> std::result::Result<(), String> {
    if progress.next_step > definition.len() {
        return Err(format!(
            "persisted position {} is past the {} steps of '{}'",
            progress.next_step,
            definition.len(),
            definition.name()
        ));
    }
    for completed in &progress.completed {
        match definition.step(completed.index) {
            Some(step) if step.name() == completed.name => {}
            _ => {
                return Err(format!(
                    "completed step '{}' at index {} does not match '{}'",
                    completed.name,
                    completed.index,
                    definition.name()
                ));
            }
        }
    }
    Ok(())
}

/// Marks an instance that cannot be driven as `Failed`.
async fn fail_unrunnable<P, E>(
    inner: &Inner<P, E>,
    mut instance: SagaInstance,
    message: String,
) -> Result<SagaStatus>
where
    P: SagaPersistence,
    E: EventBus,
{
    tracing::error!(saga_id = %instance.id, %message, "saga cannot run");
    if instance.status == SagaStatus::Pending {
        instance.transition(SagaStatus::Running)?;
    }
    instance.transition(SagaStatus::Failed)?;
    instance.failure = Some(FailureDetail::instance(message.clone()));

    match inner.store.save(&instance).await {
        Ok(_) => {}
        Err(StoreError::Conflict { .. }) => return Err(SagaError::OwnershipLost(instance.id)),
        Err(e) => return Err(e.into()),
    }
    publish(
        &inner.bus,
        SagaEvent::saga_failed(instance.id, None, message, false),
    )
    .await;
    metrics::counter!("saga_failed_total", "definition" => instance.definition_name.clone())
        .increment(1);
    Ok(SagaStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt_ctx(cancel: &CancellationToken) -> StepContext {
        StepContext::new(SagaId::new(), "attempt", 1, cancel.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempt_times_out_after_grace() {
        let stop = CancellationToken::new();
        let attempt_cancel = stop.child_token();
        let until = Some(Instant::now() + Duration::from_millis(100));

        let result: std::result::Result<(), StepError> = run_bounded(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            until,
            &stop,
            &attempt_cancel,
            &attempt_ctx(&attempt_cancel),
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(StepError::Timeout(d)) if d == Duration::from_millis(100)));
        assert!(attempt_cancel.is_cancelled());
        assert!(!stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempt_keeps_success_within_grace() {
        let stop = CancellationToken::new();
        let attempt_cancel = stop.child_token();
        let token = attempt_cancel.clone();
        stop.cancel();

        let result = run_bounded(
            async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, StepError>(7)
            },
            None,
            &stop,
            &attempt_cancel,
            &attempt_ctx(&attempt_cancel),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn bounded_attempt_reports_cancellation() {
        let stop = CancellationToken::new();
        let attempt_cancel = stop.child_token();
        stop.cancel();

        let result: std::result::Result<(), StepError> = run_bounded(
            std::future::pending(),
            None,
            &stop,
            &attempt_cancel,
            &attempt_ctx(&attempt_cancel),
            Duration::ZERO,
        )
        .await;

        assert!(matches!(result, Err(StepError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn held_attempt_is_awaited_past_grace() {
        let stop = CancellationToken::new();
        let attempt_cancel = stop.child_token();
        let ctx = attempt_ctx(&attempt_cancel);
        let unwound = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let until = Some(Instant::now() + Duration::from_millis(100));

        let result: std::result::Result<(), StepError> = run_bounded(
            {
                let ctx = ctx.clone();
                let unwound = unwound.clone();
                async move {
                    ctx.hold();
                    ctx.cancel.cancelled().await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    unwound.store(true, std::sync::atomic::Ordering::SeqCst);
                    Err(StepError::Cancelled)
                }
            },
            until,
            &stop,
            &attempt_cancel,
            &ctx,
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(StepError::Timeout(_))));
        assert!(unwound.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn held_attempt_reports_failed_unwind() {
        let stop = CancellationToken::new();
        let attempt_cancel = stop.child_token();
        let ctx = attempt_ctx(&attempt_cancel);
        stop.cancel();

        let result: std::result::Result<(), StepError> = run_bounded(
            {
                let ctx = ctx.clone();
                async move {
                    ctx.hold();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err(StepError::Compensation("email: cannot undo".to_string()))
                }
            },
            None,
            &stop,
            &attempt_cancel,
            &ctx,
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(StepError::Compensation(_))));
    }
}
