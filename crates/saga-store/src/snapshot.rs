use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaId, Version};

/// A compacted copy of a saga's replay state.
///
/// `state` reflects every step record up to and including `last_sequence`,
/// so recovery only needs to replay the records written after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaSnapshot {
    /// The instance this snapshot belongs to.
    pub saga_id: SagaId,

    /// Instance version when the snapshot was taken.
    pub version: Version,

    /// Sequence of the last step record folded into `state`.
    pub last_sequence: u64,

    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,

    /// The serialized replay state.
    pub state: serde_json::Value,
}

impl SagaSnapshot {
    /// Creates a snapshot from a raw JSON state.
    pub fn new(
        saga_id: SagaId,
        version: Version,
        last_sequence: u64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            saga_id,
            version,
            last_sequence,
            taken_at: Utc::now(),
            state,
        }
    }

    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        saga_id: SagaId,
        version: Version,
        last_sequence: u64,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            saga_id,
            version,
            last_sequence,
            serde_json::to_value(state)?,
        ))
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Returns true if this snapshot covers more history than `other`.
    pub fn supersedes(&self, other: &SagaSnapshot) -> bool {
        self.last_sequence > other.last_sequence
    }
}
