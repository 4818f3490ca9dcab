use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaContext, SagaId, StoreError};

/// Version number of a saga instance, used for optimistic concurrency control.
///
/// A new, unsaved instance is at version 0; every successful save increments
/// the version by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of an unsaved instance.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) written by the first save.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Status of one step transition in an instance's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl StepStatus {
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Completed,
        StepStatus::Failed,
        StepStatus::Compensating,
        StepStatus::Compensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Running => "Running",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
        }
    }

    /// Returns true for statuses that close an attempt.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Compensated
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown step status '{s}'"))
    }
}

/// Whether a record belongs to the forward or the compensation pass.
///
/// Needed to tell a failed compensation apart from a failed forward attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepPhase {
    #[default]
    Forward,
    Compensation,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Forward => "Forward",
            StepPhase::Compensation => "Compensation",
        }
    }
}

impl std::str::FromStr for StepPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Forward" => Ok(StepPhase::Forward),
            "Compensation" => Ok(StepPhase::Compensation),
            other => Err(format!("unknown step phase '{other}'")),
        }
    }
}

/// One step transition within a saga instance's history.
///
/// Records are append-only: a retry or a compensation adds new records and
/// never rewrites an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepRecord {
    /// The saga instance this record belongs to.
    pub saga_id: SagaId,

    /// Position in the instance's history, assigned by the store on append.
    /// Starts at 1.
    pub sequence: u64,

    /// Index of the step in the definition.
    pub step_index: usize,

    pub step_name: String,

    pub phase: StepPhase,

    pub status: StepStatus,

    /// Attempt number within the phase, starting at 1.
    pub attempt: u32,

    /// Set when a conditional step was skipped.
    pub skipped: bool,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    pub error_detail: Option<String>,

    /// Context keys written by a completed forward attempt.
    pub output: Option<SagaContext>,
}

impl SagaStepRecord {
    /// Creates a new record builder.
    pub fn builder() -> SagaStepRecordBuilder {
        SagaStepRecordBuilder::default()
    }

    /// Returns true for a completed forward attempt.
    pub fn is_forward_completion(&self) -> bool {
        self.phase == StepPhase::Forward && self.status == StepStatus::Completed
    }
}

/// Builder for step records.
#[derive(Debug, Default)]
pub struct SagaStepRecordBuilder {
    saga_id: Option<SagaId>,
    step_index: Option<usize>,
    step_name: Option<String>,
    phase: StepPhase,
    status: Option<StepStatus>,
    attempt: Option<u32>,
    skipped: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    output: Option<SagaContext>,
}

impl SagaStepRecordBuilder {
    pub fn saga_id(mut self, id: SagaId) -> Self {
        self.saga_id = Some(id);
        self
    }

    /// Sets the step position and name.
    pub fn step(mut self, index: usize, name: impl Into<String>) -> Self {
        self.step_index = Some(index);
        self.step_name = Some(name.into());
        self
    }

    pub fn phase(mut self, phase: StepPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn skipped(mut self, skipped: bool) -> Self {
        self.skipped = skipped;
        self
    }

    /// Sets the start time. Defaults to the finish time for finished
    /// records, otherwise to the current time.
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Marks the attempt as finished now.
    pub fn finished(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn output(mut self, output: SagaContext) -> Self {
        self.output = Some(output);
        self
    }

    /// Builds the record, leaving `sequence` for the store to assign.
    pub fn build(self) -> Result<SagaStepRecord, StoreError> {
        let missing = |field: &str| StoreError::Invalid(format!("step record is missing {field}"));

        let attempt = self.attempt.unwrap_or(1);
        if attempt == 0 {
            return Err(StoreError::Invalid("attempt numbers start at 1".to_string()));
        }

        Ok(SagaStepRecord {
            saga_id: self.saga_id.ok_or_else(|| missing("saga_id"))?,
            sequence: 0,
            step_index: self.step_index.ok_or_else(|| missing("step_index"))?,
            step_name: self.step_name.ok_or_else(|| missing("step_name"))?,
            phase: self.phase,
            status: self.status.ok_or_else(|| missing("status"))?,
            attempt,
            skipped: self.skipped,
            started_at: self
                .started_at
                .or(self.finished_at)
                .unwrap_or_else(Utc::now),
            finished_at: self.finished_at,
            error_detail: self.error_detail,
            output: self.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn record_builder_fills_defaults() {
        let saga_id = SagaId::new();
        let record = SagaStepRecord::builder()
            .saga_id(saga_id)
            .step(2, "charge")
            .status(StepStatus::Running)
            .build()
            .unwrap();

        assert_eq!(record.saga_id, saga_id);
        assert_eq!(record.sequence, 0);
        assert_eq!(record.step_index, 2);
        assert_eq!(record.step_name, "charge");
        assert_eq!(record.phase, StepPhase::Forward);
        assert_eq!(record.attempt, 1);
        assert!(!record.skipped);
        assert!(record.finished_at.is_none());
        assert!(!record.is_forward_completion());
    }

    #[test]
    fn finished_record_never_starts_after_it_finished() {
        let record = SagaStepRecord::builder()
            .saga_id(SagaId::new())
            .step(0, "reserve")
            .status(StepStatus::Failed)
            .finished()
            .error("out of stock")
            .build()
            .unwrap();

        let finished_at = record.finished_at.unwrap();
        assert_eq!(record.started_at, finished_at);
    }

    #[test]
    fn explicit_start_is_kept_for_finished_record() {
        let started_at = Utc::now() - chrono::Duration::seconds(3);
        let record = SagaStepRecord::builder()
            .saga_id(SagaId::new())
            .step(1, "charge")
            .status(StepStatus::Completed)
            .started_at(started_at)
            .finished()
            .build()
            .unwrap();

        assert_eq!(record.started_at, started_at);
        assert!(record.finished_at.unwrap() >= started_at);
    }

    #[test]
    fn record_builder_rejects_missing_fields() {
        let err = SagaStepRecord::builder()
            .step(0, "reserve")
            .status(StepStatus::Running)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("saga_id"));

        let err = SagaStepRecord::builder()
            .saga_id(SagaId::new())
            .step(0, "reserve")
            .status(StepStatus::Running)
            .attempt(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn step_status_parse_round_trip() {
        for status in StepStatus::ALL {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert_eq!("Compensation".parse::<StepPhase>().unwrap(), StepPhase::Compensation);
        assert!("Sideways".parse::<StepPhase>().is_err());
    }
}
