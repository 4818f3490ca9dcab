//! Saga lifecycle events published on the event bus.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::bus::Event;

/// Every lifecycle event type, in the order a saga can first emit them.
pub const LIFECYCLE_EVENT_TYPES: [&str; 10] = [
    "SagaStarted",
    "StepStarted",
    "StepCompleted",
    "StepFailed",
    "SagaCompensating",
    "StepCompensating",
    "StepCompensated",
    "SagaCompensated",
    "SagaCompleted",
    "SagaFailed",
];

/// Events emitted while a saga runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The instance started running.
    SagaStarted(SagaStartedData),

    /// Every step completed.
    SagaCompleted(SagaFinishedData),

    /// The instance ended in `Failed`.
    SagaFailed(SagaFailedData),

    /// A step failed for good; compensation begins.
    SagaCompensating(SagaCompensatingData),

    /// Every completed step was compensated.
    SagaCompensated(SagaFinishedData),

    /// A forward attempt started.
    StepStarted(StepData),

    /// A forward attempt succeeded (or a conditional step was skipped).
    StepCompleted(StepCompletedData),

    /// A step gave up after its last attempt.
    StepFailed(StepFailedData),

    /// A compensation attempt started.
    StepCompensating(StepData),

    /// A step was compensated.
    StepCompensated(StepData),
}

impl SagaEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::SagaCompensating(_) => "SagaCompensating",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::StepCompensating(_) => "StepCompensating",
            SagaEvent::StepCompensated(_) => "StepCompensated",
        }
    }

    pub fn saga_id(&self) -> SagaId {
        match self {
            SagaEvent::SagaStarted(data) => data.saga_id,
            SagaEvent::SagaCompleted(data) | SagaEvent::SagaCompensated(data) => data.saga_id,
            SagaEvent::SagaFailed(data) => data.saga_id,
            SagaEvent::SagaCompensating(data) => data.saga_id,
            SagaEvent::StepStarted(data)
            | SagaEvent::StepCompensating(data)
            | SagaEvent::StepCompensated(data) => data.saga_id,
            SagaEvent::StepCompleted(data) => data.saga_id,
            SagaEvent::StepFailed(data) => data.saga_id,
        }
    }

    /// The step this event is about, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            SagaEvent::StepStarted(data)
            | SagaEvent::StepCompensating(data)
            | SagaEvent::StepCompensated(data) => Some(&data.step_name),
            SagaEvent::StepCompleted(data) => Some(&data.step_name),
            SagaEvent::StepFailed(data) => Some(&data.step_name),
            SagaEvent::SagaFailed(data) => data.step_name.as_deref(),
            _ => None,
        }
    }

    /// Wraps the event for the bus.
    pub fn to_bus_event(&self) -> Result<Event, serde_json::Error> {
        Ok(Event::new(self.event_type(), serde_json::to_value(self)?).with_saga(self.saga_id()))
    }

    /// Reads a lifecycle event back from a bus event.
    pub fn from_bus_event(event: &Event) -> Result<Self, serde_json::Error> {
        serde_json::from_value(event.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub definition_name: String,
    pub started_at: DateTime<Utc>,
}

/// Data for SagaCompleted and SagaCompensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFinishedData {
    pub saga_id: SagaId,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub saga_id: SagaId,
    /// The step whose failure ended the saga, if any.
    pub step_name: Option<String>,
    pub reason: String,
    pub during_compensation: bool,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompensatingData {
    pub saga_id: SagaId,
    /// The step that triggered compensation.
    pub from_step: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub saga_id: SagaId,
    pub step_name: String,
    pub step_index: usize,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub saga_id: SagaId,
    pub step_name: String,
    pub step_index: usize,
    pub attempt: u32,
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub saga_id: SagaId,
    pub step_name: String,
    pub step_index: usize,
    pub attempt: u32,
    pub error: String,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(saga_id: SagaId, definition_name: impl Into<String>) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            definition_name: definition_name.into(),
            started_at: Utc::now(),
        })
    }

    pub fn saga_completed(saga_id: SagaId) -> Self {
        SagaEvent::SagaCompleted(SagaFinishedData {
            saga_id,
            finished_at: Utc::now(),
        })
    }

    pub fn saga_compensated(saga_id: SagaId) -> Self {
        SagaEvent::SagaCompensated(SagaFinishedData {
            saga_id,
            finished_at: Utc::now(),
        })
    }

    pub fn saga_failed(
        saga_id: SagaId,
        step_name: Option<String>,
        reason: impl Into<String>,
        during_compensation: bool,
    ) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            saga_id,
            step_name,
            reason: reason.into(),
            during_compensation,
            failed_at: Utc::now(),
        })
    }

    pub fn saga_compensating(
        saga_id: SagaId,
        from_step: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SagaEvent::SagaCompensating(SagaCompensatingData {
            saga_id,
            from_step: from_step.into(),
            reason: reason.into(),
        })
    }

    pub fn step_started(saga_id: SagaId, step_name: &str, step_index: usize, attempt: u32) -> Self {
        SagaEvent::StepStarted(StepData::new(saga_id, step_name, step_index, attempt))
    }

    pub fn step_completed(
        saga_id: SagaId,
        step_name: &str,
        step_index: usize,
        attempt: u32,
        skipped: bool,
    ) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            saga_id,
            step_name: step_name.to_string(),
            step_index,
            attempt,
            skipped,
        })
    }

    pub fn step_failed(
        saga_id: SagaId,
        step_name: &str,
        step_index: usize,
        attempt: u32,
        error: impl Into<String>,
    ) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            saga_id,
            step_name: step_name.to_string(),
            step_index,
            attempt,
            error: error.into(),
        })
    }

    pub fn step_compensating(
        saga_id: SagaId,
        step_name: &str,
        step_index: usize,
        attempt: u32,
    ) -> Self {
        SagaEvent::StepCompensating(StepData::new(saga_id, step_name, step_index, attempt))
    }

    pub fn step_compensated(
        saga_id: SagaId,
        step_name: &str,
        step_index: usize,
        attempt: u32,
    ) -> Self {
        SagaEvent::StepCompensated(StepData::new(saga_id, step_name, step_index, attempt))
    }
}

impl StepData {
    fn new(saga_id: SagaId, step_name: &str, step_index: usize, attempt: u32) -> Self {
        Self {
            saga_id,
            step_name: step_name.to_string(),
            step_index,
            attempt,
        }
    }
}
