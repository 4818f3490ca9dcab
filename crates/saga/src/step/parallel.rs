use std::sync::Arc;

use async_trait::async_trait;
use common::SagaContext;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{SagaStep, StepContext, StepOutput};
use crate::error::StepError;

/// How a parallel group reacts to a failing sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinPolicy {
    /// Let every sub-step finish, then undo the completed ones.
    #[default]
    WaitAll,
    /// Cancel the remaining sub-steps on the first failure.
    FailFast,
}

/// Runs sub-steps concurrently and joins their outputs.
///
/// On failure, no sub-step is left running: in-flight ones are awaited
/// (after cancellation under [`JoinPolicy::FailFast`]), then the completed
/// ones are compensated in reverse completion order before the first
/// failure is returned. Two sub-steps writing the same key is a failure.
///
/// Once a sub-step has completed the attempt is held, so a step timeout or
/// a saga cancel waits for the join and its compensation instead of
/// dropping them. If a completed sub-step cannot be undone the group fails
/// with [`StepError::Compensation`].
///
/// Compensating the whole group later undoes sub-steps in reverse
/// declaration order, since the completion order of a past attempt is not
/// part of its output.
pub struct ParallelStep {
    name: String,
    policy: JoinPolicy,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl ParallelStep {
    pub fn new(name: impl Into<String>, policy: JoinPolicy, steps: Vec<Arc<dyn SagaStep>>) -> Self {
        Self {
            name: name.into(),
            policy,
            steps,
        }
    }

    pub fn policy(&self) -> JoinPolicy {
        self.policy
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    /// Compensates the given sub-steps in order, attempting all of them.
    async fn compensate_subset(
        &self,
        ctx: &StepContext,
        data: &SagaContext,
        indices: impl Iterator<Item = usize>,
    ) -> Result<(), String> {
        let mut failures = Vec::new();
        for index in indices {
            let step = &self.steps[index];
            // Compensation is not interruptible
            let sub_ctx = ctx.for_sub_step(step.name(), CancellationToken::new());
            if let Err(e) = step.compensate(&sub_ctx, data).await {
                tracing::error!(
                    saga_id = %ctx.saga_id,
                    group = %self.name,
                    step = %step.name(),
                    error = %e,
                    "sub-step compensation failed"
                );
                failures.push(format!("{}: {e}", step.name()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(format!("compensation failed for {}", failures.join("; ")))
        }
    }
}

#[async_trait]
impl SagaStep for ParallelStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(
        &self,
        ctx: &StepContext,
        data: &SagaContext,
    ) -> Result<StepOutput, StepError> {
        let group_cancel = ctx.cancel.child_token();

        let mut running: FuturesUnordered<_> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let sub_ctx = ctx.for_sub_step(step.name(), group_cancel.clone());
                async move {
                    let result = step.forward(&sub_ctx, data).await;
                    (index, result)
                }
            })
            .collect();

        let mut completed = Vec::with_capacity(self.steps.len());
        let mut merged = SagaContext::new();
        let mut failure: Option<StepError> = None;

        while let Some((index, result)) = running.next().await {
            let error = match result {
                Ok(output) => {
                    ctx.hold();
                    completed.push(index);
                    match merged.merge(self.steps[index].name(), &output.data) {
                        Ok(()) => continue,
                        Err(e) => StepError::from(e),
                    }
                }
                Err(e) => e,
            };

            if failure.is_none() {
                tracing::debug!(
                    saga_id = %ctx.saga_id,
                    group = %self.name,
                    step = %self.steps[index].name(),
                    error = %error,
                    "sub-step failed"
                );
                failure = Some(error);
                if self.policy == JoinPolicy::FailFast {
                    group_cancel.cancel();
                }
            }
        }

        let Some(failure) = failure else {
            return Ok(StepOutput::with_data(merged));
        };

        if let Err(e) = self
            .compensate_subset(ctx, data, completed.into_iter().rev())
            .await
        {
            return Err(StepError::Compensation(format!("{failure}; {e}")));
        }
        Err(failure)
    }

    async fn compensate(&self, ctx: &StepContext, data: &SagaContext) -> Result<(), StepError> {
        self.compensate_subset(ctx, data, (0..self.steps.len()).rev())
            .await
            .map_err(StepError::Execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps, then succeeds or fails. Counts compensations.
    struct Worker {
        name: String,
        delay: Duration,
        fail: bool,
        key: &'static str,
        compensations: Arc<AtomicUsize>,
        saw_cancel: Arc<AtomicUsize>,
        undo_fails: bool,
        undo_log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl Worker {
        fn new(name: &str, delay_ms: u64, fail: bool) -> Self {
            Self {
                name: name.to_string(),
                delay: Duration::from_millis(delay_ms),
                fail,
                key: "",
                compensations: Arc::new(AtomicUsize::new(0)),
                saw_cancel: Arc::new(AtomicUsize::new(0)),
                undo_fails: false,
                undo_log: None,
            }
        }

        fn undo_fails(mut self) -> Self {
            self.undo_fails = true;
            self
        }

        fn logs_undo_to(mut self, log: &Arc<Mutex<Vec<String>>>) -> Self {
            self.undo_log = Some(log.clone());
            self
        }

        fn writes(mut self, key: &'static str) -> Self {
            self.key = key;
            self
        }
    }

    #[async_trait]
    impl SagaStep for Worker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn forward(
            &self,
            ctx: &StepContext,
            _data: &SagaContext,
        ) -> Result<StepOutput, StepError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => {
                    self.saw_cancel.fetch_add(1, Ordering::SeqCst);
                    return Err(StepError::Cancelled);
                }
            }
            if self.fail {
                return Err(StepError::execution(format!("{} broke", self.name)));
            }
            let key = if self.key.is_empty() { self.name.as_str() } else { self.key };
            Ok(StepOutput::empty().set(key, json!(true)))
        }

        async fn compensate(
            &self,
            _ctx: &StepContext,
            _data: &SagaContext,
        ) -> Result<(), StepError> {
            if self.undo_fails {
                return Err(StepError::execution(format!("{} cannot be undone", self.name)));
            }
            self.compensations.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.undo_log {
                log.lock().unwrap().push(self.name.clone());
            }
            Ok(())
        }
    }

    fn ctx() -> StepContext {
        StepContext::new(SagaId::new(), "group", 1, CancellationToken::new())
    }

    fn counters(workers: &[&Worker]) -> Vec<Arc<AtomicUsize>> {
        workers.iter().map(|w| w.compensations.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn all_succeed_and_outputs_merge() {
        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![
                Arc::new(Worker::new("a", 30, false)),
                Arc::new(Worker::new("b", 10, false)),
            ],
        );

        let output = group.forward(&ctx(), &SagaContext::new()).await.unwrap();

        assert_eq!(output.data.len(), 2);
        assert_eq!(output.data.writer_of("a"), Some("a"));
        assert_eq!(output.data.writer_of("b"), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_all_compensates_completed_exactly_once() {
        let fast = Worker::new("fast", 10, false);
        let broken = Worker::new("broken", 20, true);
        let slow = Worker::new("slow", 50, false);
        let [fast_c, broken_c, slow_c]: [Arc<AtomicUsize>; 3] =
            counters(&[&fast, &broken, &slow]).try_into().unwrap();
        let slow_cancel = slow.saw_cancel.clone();

        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![Arc::new(fast), Arc::new(broken), Arc::new(slow)],
        );

        let err = group.forward(&ctx(), &SagaContext::new()).await.unwrap_err();

        assert!(err.to_string().contains("broken broke"));
        // slow was allowed to finish, then undone with fast
        assert_eq!(slow_cancel.load(Ordering::SeqCst), 0);
        assert_eq!(fast_c.load(Ordering::SeqCst), 1);
        assert_eq!(slow_c.load(Ordering::SeqCst), 1);
        assert_eq!(broken_c.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fast_cancels_in_flight_sub_steps() {
        let fast = Worker::new("fast", 10, false);
        let broken = Worker::new("broken", 20, true);
        let slow = Worker::new("slow", 5_000, false);
        let [fast_c, _, slow_c]: [Arc<AtomicUsize>; 3] =
            counters(&[&fast, &broken, &slow]).try_into().unwrap();
        let slow_cancel = slow.saw_cancel.clone();

        let group = ParallelStep::new(
            "group",
            JoinPolicy::FailFast,
            vec![Arc::new(fast), Arc::new(broken), Arc::new(slow)],
        );

        let started = tokio::time::Instant::now();
        let err = group.forward(&ctx(), &SagaContext::new()).await.unwrap_err();

        assert!(err.to_string().contains("broken broke"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(slow_cancel.load(Ordering::SeqCst), 1);
        assert_eq!(fast_c.load(Ordering::SeqCst), 1);
        assert_eq!(slow_c.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_keys_across_sub_steps_fail() {
        let first = Worker::new("first", 10, false).writes("shared");
        let second = Worker::new("second", 20, false).writes("shared");
        let [first_c, second_c]: [Arc<AtomicUsize>; 2] =
            counters(&[&first, &second]).try_into().unwrap();

        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![Arc::new(first), Arc::new(second)],
        );

        let err = group.forward(&ctx(), &SagaContext::new()).await.unwrap_err();

        assert!(matches!(err, StepError::Context(_)));
        assert_eq!(first_c.load(Ordering::SeqCst), 1);
        assert_eq!(second_c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn group_compensation_undoes_every_sub_step() {
        let a = Worker::new("a", 0, false);
        let b = Worker::new("b", 0, false);
        let [a_c, b_c]: [Arc<AtomicUsize>; 2] = counters(&[&a, &b]).try_into().unwrap();
        let group = ParallelStep::new("group", JoinPolicy::WaitAll, vec![Arc::new(a), Arc::new(b)]);

        group.compensate(&ctx(), &SagaContext::new()).await.unwrap();

        assert_eq!(a_c.load(Ordering::SeqCst), 1);
        assert_eq!(b_c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_sub_step_fails_group_without_retry() {
        let email = Worker::new("email", 10, false).undo_fails();
        let sms = Worker::new("sms", 20, true);
        let group = ParallelStep::new(
            "notify",
            JoinPolicy::WaitAll,
            vec![Arc::new(email), Arc::new(sms)],
        );

        let err = group.forward(&ctx(), &SagaContext::new()).await.unwrap_err();

        assert!(matches!(err, StepError::Compensation(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("email cannot be undone"));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_sub_step_holds_the_attempt() {
        let ctx = ctx();
        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![
                Arc::new(Worker::new("done", 10, false)),
                Arc::new(Worker::new("broken", 20, true)),
            ],
        );

        group.forward(&ctx, &SagaContext::new()).await.unwrap_err();
        assert!(ctx.is_held());

        let untouched = StepContext::new(SagaId::new(), "group", 1, CancellationToken::new());
        let failing = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![Arc::new(Worker::new("broken", 10, true))],
        );
        failing.forward(&untouched, &SagaContext::new()).await.unwrap_err();
        assert!(!untouched.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_undoes_in_reverse_completion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![
                Arc::new(Worker::new("second", 20, false).logs_undo_to(&log)),
                Arc::new(Worker::new("first", 10, false).logs_undo_to(&log)),
                Arc::new(Worker::new("broken", 30, true)),
            ],
        );

        group.forward(&ctx(), &SagaContext::new()).await.unwrap_err();

        assert_eq!(*log.lock().unwrap(), ["second", "first"]);
    }

    #[tokio::test]
    async fn group_compensation_runs_in_reverse_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let group = ParallelStep::new(
            "group",
            JoinPolicy::WaitAll,
            vec![
                Arc::new(Worker::new("a", 0, false).logs_undo_to(&log)),
                Arc::new(Worker::new("b", 0, false).logs_undo_to(&log)),
                Arc::new(Worker::new("c", 0, false).logs_undo_to(&log)),
            ],
        );

        group.compensate(&ctx(), &SagaContext::new()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["c", "b", "a"]);
    }
}
