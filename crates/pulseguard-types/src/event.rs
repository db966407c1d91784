//! Event envelope for the exposed streams.
//!
//! Four streams leave the safety core: state changes, interlock status,
//! protocol progress and fault details. All of them travel as an [`Event`]
//! carrying one [`EventPayload`] variant.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ExecutionStatus;
use crate::state::{SafetyState, TransitionCause};

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "pulseguard-kernel::safety"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    StateChanged(StateChange),
    InterlockStatus(VerdictSnapshot),
    ProtocolProgress(ProgressUpdate),
    Fault(FaultEvent),
}

/// One safety state machine transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub previous: SafetyState,
    pub new: SafetyState,
    pub cause: TransitionCause,
}

/// Per-line progress of a protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub protocol_id: String,
    pub line_index: usize,
    pub loop_iteration: u32,
    pub status: ExecutionStatus,
}

/// Fault detail emitted by the selective shutdown coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub cause: TransitionCause,
    pub failed_interlock: Option<String>,
    /// Fault state that was entered.
    pub state: SafetyState,
    pub timestamp: DateTime<Utc>,
}

/// Result of one interlock aggregator sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictSnapshot {
    pub overall_satisfied: bool,
    pub per_interlock: BTreeMap<String, bool>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl VerdictSnapshot {
    /// The snapshot seen before the aggregator has produced anything.
    /// Unsatisfied and infinitely old.
    pub fn unavailable() -> Self {
        Self {
            overall_satisfied: false,
            per_interlock: BTreeMap::new(),
            sequence: 0,
            timestamp: DateTime::<Utc>::default(),
        }
    }

    /// Names of the interlocks that were not satisfied, in name order.
    pub fn failed(&self) -> Vec<String> {
        self.per_interlock
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Time elapsed since the sample was taken. Clock skew into the future
    /// counts as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// `true` when satisfied and no older than `max_age`.
    pub fn permits(&self, max_age: Duration) -> bool {
        self.overall_satisfied && self.sequence > 0 && self.age() <= max_age
    }
}
