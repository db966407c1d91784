//! The single error type shared by every PulseGuard crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::SafetyState;

/// Global error type spanning configuration problems, interlock and watchdog
/// faults, hardware failures and rejected operator requests.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SafetyError {
    /// Invalid protocol, limits or controller configuration. Rejected before
    /// anything executes.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Interlock Violation: {failed:?}")]
    InterlockViolation { failed: Vec<String> },

    #[error("Watchdog Timeout: {missed} consecutive heartbeat failures")]
    WatchdogTimeout { missed: u32 },

    #[error("Hardware Fault on {capability}: {details}")]
    HardwareFault { capability: String, details: String },

    #[error("Operator Abort: {0}")]
    OperatorAbort(String),

    /// The request is not valid in the current state. The state is unchanged.
    #[error("State Conflict: cannot {request} while {state}")]
    StateConflict { state: SafetyState, request: String },

    #[error("Safety Violation: energy delivery requires TREATING but state is {state}")]
    SafetyViolation { state: SafetyState },

    #[error("Limit Violation on line {line}: {details}")]
    LimitViolation { line: usize, details: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel Error: {0}")]
    Channel(String),
}

impl SafetyError {
    /// `true` for errors that must drive the state machine into UNSAFE.
    pub fn routes_to_unsafe(&self) -> bool {
        matches!(
            self,
            SafetyError::InterlockViolation { .. }
                | SafetyError::WatchdogTimeout { .. }
                | SafetyError::HardwareFault { .. }
                | SafetyError::Timeout(_)
        )
    }

    pub fn state_conflict(state: SafetyState, request: impl Into<String>) -> Self {
        SafetyError::StateConflict {
            state,
            request: request.into(),
        }
    }

    pub fn hardware(capability: impl Into<String>, details: impl Into<String>) -> Self {
        SafetyError::HardwareFault {
            capability: capability.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_conflict_names_state_and_request() {
        let err = SafetyError::state_conflict(SafetyState::EmergencyStop, "arm");
        let msg = err.to_string();
        assert!(msg.contains("arm"));
        assert!(msg.contains("EMERGENCY_STOP"));
    }

    #[test]
    fn escalation_classification() {
        assert!(SafetyError::hardware("energy", "no ack").routes_to_unsafe());
        assert!(SafetyError::WatchdogTimeout { missed: 2 }.routes_to_unsafe());
        assert!(!SafetyError::Configuration("bad".into()).routes_to_unsafe());
        assert!(!SafetyError::OperatorAbort("stop".into()).routes_to_unsafe());
        assert!(
            !SafetyError::LimitViolation {
                line: 0,
                details: "too hot".into()
            }
            .routes_to_unsafe()
        );
    }

    #[test]
    fn interlock_violation_lists_names() {
        let err = SafetyError::InterlockViolation {
            failed: vec!["door".into()],
        };
        assert!(err.to_string().contains("door"));
    }
}
