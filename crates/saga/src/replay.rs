//! Rebuilding a run-loop's progress from persisted step records.

use std::collections::{BTreeMap, BTreeSet};

use common::{ContextError, SagaContext};
use saga_store::{SagaStepRecord, StepPhase, StepStatus};
use serde::{Deserialize, Serialize};

/// A step whose forward attempt completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub index: usize,
    pub name: String,
    pub skipped: bool,
}

/// An attempt with a `Running` or `Compensating` record and no outcome yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub index: usize,
    pub phase: StepPhase,
    pub attempt: u32,
}

/// The latest failed attempt of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub index: usize,
    pub name: String,
    pub attempt: u32,
    pub error: String,
}

/// Everything a run-loop needs to continue an instance.
///
/// Built by folding step records in sequence order. Snapshots store this
/// state serialized, so a replay can start from a snapshot instead of the
/// first record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaProgress {
    /// Initial input plus the outputs of completed steps.
    pub context: SagaContext,
    /// Next forward step to run.
    pub next_step: usize,
    /// Completed forward steps, in completion order.
    pub completed: Vec<CompletedStep>,
    /// Indices of compensated steps.
    pub compensated: BTreeSet<usize>,
    /// Last forward attempt number per step.
    pub forward_attempts: BTreeMap<usize, u32>,
    /// Last compensation attempt number per step.
    pub compensation_attempts: BTreeMap<usize, u32>,
    pub in_flight: Option<InFlight>,
    pub forward_failure: Option<StepFailure>,
    pub compensation_failure: Option<StepFailure>,
    /// Sequence of the last record applied.
    pub last_sequence: u64,
    pub records_applied: u64,
}

impl SagaProgress {
    /// Progress of an instance that has not run any step.
    pub fn new(initial: SagaContext) -> Self {
        Self {
            context: initial,
            ..Self::default()
        }
    }

    /// Folds a sequence of records into `self`.
    pub fn replay<'a>(
        mut self,
        records: impl IntoIterator<Item = &'a SagaStepRecord>,
    ) -> Result<Self, ContextError> {
        for record in records {
            self.apply(record)?;
        }
        Ok(self)
    }

    /// Applies one record.
    ///
    /// Records at or below `last_sequence` are already folded in and are
    /// ignored, so replaying the records after a snapshot is safe even if
    /// the store returns some of them twice.
    pub fn apply(&mut self, record: &SagaStepRecord) -> Result<(), ContextError> {
        if record.sequence != 0 && record.sequence <= self.last_sequence {
            return Ok(());
        }

        let index = record.step_index;
        match (record.phase, record.status) {
            (StepPhase::Forward, StepStatus::Running) => {
                self.forward_attempts.insert(index, record.attempt);
                self.in_flight = Some(InFlight {
                    index,
                    phase: StepPhase::Forward,
                    attempt: record.attempt,
                });
                self.forward_failure = None;
            }
            (StepPhase::Forward, StepStatus::Completed) => {
                if let Some(ref output) = record.output {
                    self.context.merge(&record.step_name, output)?;
                }
                if !self.completed.iter().any(|c| c.index == index) {
                    self.completed.push(CompletedStep {
                        index,
                        name: record.step_name.clone(),
                        skipped: record.skipped,
                    });
                }
                self.next_step = self.next_step.max(index + 1);
                self.in_flight = None;
                self.forward_failure = None;
            }
            (StepPhase::Forward, StepStatus::Failed) => {
                self.in_flight = None;
                self.forward_failure = Some(failure_of(record));
            }
            (StepPhase::Compensation, StepStatus::Compensating) => {
                self.compensation_attempts.insert(index, record.attempt);
                self.in_flight = Some(InFlight {
                    index,
                    phase: StepPhase::Compensation,
                    attempt: record.attempt,
                });
                self.compensation_failure = None;
            }
            (StepPhase::Compensation, StepStatus::Compensated) => {
                self.compensated.insert(index);
                self.in_flight = None;
                self.compensation_failure = None;
            }
            (StepPhase::Compensation, StepStatus::Failed) => {
                self.in_flight = None;
                self.compensation_failure = Some(failure_of(record));
            }
            (phase, status) => {
                tracing::debug!(
                    saga_id = %record.saga_id,
                    step = %record.step_name,
                    phase = phase.as_str(),
                    status = %status,
                    "ignoring record during replay"
                );
            }
        }

        self.last_sequence = self.last_sequence.max(record.sequence);
        self.records_applied += 1;
        Ok(())
    }

    /// Attempt number for the next forward attempt of a step.
    pub fn next_forward_attempt(&self, index: usize) -> u32 {
        self.forward_attempts.get(&index).map_or(1, |a| a + 1)
    }

    /// Attempt number for the next compensation attempt of a step.
    pub fn next_compensation_attempt(&self, index: usize) -> u32 {
        self.compensation_attempts.get(&index).map_or(1, |a| a + 1)
    }

    /// Steps still to compensate, in the order to compensate them.
    pub fn compensation_queue(&self) -> Vec<CompletedStep> {
        self.completed
            .iter()
            .rev()
            .filter(|c| !c.skipped && !self.compensated.contains(&c.index))
            .cloned()
            .collect()
    }

    pub fn is_completed(&self, index: usize) -> bool {
        self.completed.iter().any(|c| c.index == index)
    }
}

fn failure_of(record: &SagaStepRecord) -> StepFailure {
    StepFailure {
        index: record.step_index,
        name: record.step_name.clone(),
        attempt: record.attempt,
        error: record
            .error_detail
            .clone()
            .unwrap_or_else(|| "unknown error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use saga_store::{SagaSnapshot, Version};
    use serde_json::json;

    struct History {
        saga_id: SagaId,
        records: Vec<SagaStepRecord>,
    }

    impl History {
        fn new() -> Self {
            Self {
                saga_id: SagaId::new(),
                records: Vec::new(),
            }
        }

        fn push(
            &mut self,
            index: usize,
            name: &str,
            phase: StepPhase,
            status: StepStatus,
            attempt: u32,
        ) -> &mut SagaStepRecord {
            let mut record = SagaStepRecord::builder()
                .saga_id(self.saga_id)
                .step(index, name)
                .phase(phase)
                .status(status)
                .attempt(attempt)
                .build()
                .unwrap();
            record.sequence = self.records.len() as u64 + 1;
            self.records.push(record);
            self.records.last_mut().unwrap()
        }

        fn completed(&mut self, index: usize, name: &str, key: &str) {
            self.push(index, name, StepPhase::Forward, StepStatus::Running, 1);
            let record = self.push(index, name, StepPhase::Forward, StepStatus::Completed, 1);
            record.output = Some(SagaContext::new().with(key, json!(index)));
        }
    }

    #[test]
    fn completed_steps_advance_and_merge() {
        let mut history = History::new();
        history.completed(0, "reserve", "reservation_id");
        history.completed(1, "charge", "payment_id");

        let progress = SagaProgress::new(SagaContext::new().with("order_id", json!("o-1")))
            .replay(&history.records)
            .unwrap();

        assert_eq!(progress.next_step, 2);
        assert_eq!(progress.context.writer_of("payment_id"), Some("charge"));
        assert_eq!(progress.context.writer_of("order_id"), None);
        assert_eq!(progress.last_sequence, 4);
        assert!(progress.in_flight.is_none());
    }

    #[test]
    fn running_record_is_in_flight() {
        let mut history = History::new();
        history.completed(0, "reserve", "reservation_id");
        history.push(1, "charge", StepPhase::Forward, StepStatus::Running, 1);

        let progress = SagaProgress::default().replay(&history.records).unwrap();

        assert_eq!(progress.next_step, 1);
        assert_eq!(
            progress.in_flight,
            Some(InFlight {
                index: 1,
                phase: StepPhase::Forward,
                attempt: 1
            })
        );
        assert_eq!(progress.next_forward_attempt(1), 2);
    }

    #[test]
    fn failures_are_cleared_by_a_new_attempt() {
        let mut history = History::new();
        history.push(0, "reserve", StepPhase::Forward, StepStatus::Running, 1);
        history
            .push(0, "reserve", StepPhase::Forward, StepStatus::Failed, 1)
            .error_detail = Some("out of stock".into());

        let progress = SagaProgress::default().replay(&history.records).unwrap();
        let failure = progress.forward_failure.clone().unwrap();
        assert_eq!(failure.attempt, 1);
        assert_eq!(failure.error, "out of stock");

        history.push(0, "reserve", StepPhase::Forward, StepStatus::Running, 2);
        let progress = SagaProgress::default().replay(&history.records).unwrap();
        assert!(progress.forward_failure.is_none());
    }

    #[test]
    fn compensation_queue_is_reverse_and_skips_done_work() {
        let mut history = History::new();
        history.completed(0, "reserve", "a");
        history.push(1, "gift", StepPhase::Forward, StepStatus::Completed, 1).skipped = true;
        history.completed(2, "charge", "b");
        history.completed(3, "ship", "c");
        history.push(3, "ship", StepPhase::Compensation, StepStatus::Compensating, 1);
        history.push(3, "ship", StepPhase::Compensation, StepStatus::Compensated, 1);

        let progress = SagaProgress::default().replay(&history.records).unwrap();
        let queue: Vec<_> = progress
            .compensation_queue()
            .into_iter()
            .map(|c| c.name)
            .collect();

        assert_eq!(queue, ["charge", "reserve"]);
    }

    #[test]
    fn snapshot_then_tail_matches_full_replay() {
        let mut history = History::new();
        history.completed(0, "reserve", "a");
        history.completed(1, "charge", "b");
        history.completed(2, "ship", "c");

        let full = SagaProgress::default().replay(&history.records).unwrap();

        let head = SagaProgress::default()
            .replay(&history.records[..3])
            .unwrap();
        let snapshot =
            SagaSnapshot::from_state(history.saga_id, Version::new(3), head.last_sequence, &head)
                .unwrap();
        let restored: SagaProgress = snapshot.into_state().unwrap();
        // Overlapping records are ignored
        let resumed = restored.replay(&history.records[2..]).unwrap();

        assert_eq!(resumed, full);
    }
}
