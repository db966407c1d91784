//! Operating state of the device and the causes that move it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The operating state owned by the safety state machine.
///
/// Energy output is permitted only in [`SafetyState::Treating`].
/// [`SafetyState::EmergencyStop`] is absorbing except via an explicit manual
/// clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    /// Initial state. Nothing is energised and no protocol may run.
    #[default]
    Safe,
    /// Interlocks were satisfied at arm time; heartbeats are flowing.
    Armed,
    /// A protocol is executing. The only state in which energy output may be
    /// non-zero.
    Treating,
    /// A fault was detected. Cleared only by an explicit operator request.
    Unsafe,
    /// Operator emergency stop. Cleared only by an explicit operator request.
    EmergencyStop,
}

impl SafetyState {
    /// `true` only for [`SafetyState::Treating`].
    pub fn energy_permitted(self) -> bool {
        matches!(self, SafetyState::Treating)
    }

    /// `true` for the two fault states.
    pub fn is_fault(self) -> bool {
        matches!(self, SafetyState::Unsafe | SafetyState::EmergencyStop)
    }

    /// `true` while the external watchdog must be kept alive.
    pub fn heartbeat_required(self) -> bool {
        matches!(self, SafetyState::Armed | SafetyState::Treating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SafetyState::Safe => "SAFE",
            SafetyState::Armed => "ARMED",
            SafetyState::Treating => "TREATING",
            SafetyState::Unsafe => "UNSAFE",
            SafetyState::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened. Carried on every state-change and fault event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TransitionCause {
    OperatorArm,
    OperatorStart { protocol: String },
    OperatorStop,
    ProtocolComplete,
    RunAborted { reason: String },
    /// One or more interlocks stopped being satisfied.
    InterlockLost { failed: Vec<String> },
    WatchdogMissed,
    HardwareFault { capability: String, details: String },
    EmergencyStop,
    FaultCleared,
    EmergencyCleared,
}

impl TransitionCause {
    /// Name of the first failed interlock, if this cause is an interlock loss.
    pub fn failed_interlock(&self) -> Option<&str> {
        match self {
            TransitionCause::InterlockLost { failed } => failed.first().map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionCause::OperatorArm => write!(f, "operator arm"),
            TransitionCause::OperatorStart { protocol } => {
                write!(f, "operator start of protocol '{protocol}'")
            }
            TransitionCause::OperatorStop => write!(f, "operator stop"),
            TransitionCause::ProtocolComplete => write!(f, "protocol complete"),
            TransitionCause::RunAborted { reason } => write!(f, "run aborted: {reason}"),
            TransitionCause::InterlockLost { failed } => {
                write!(f, "interlock lost: {}", failed.join(", "))
            }
            TransitionCause::WatchdogMissed => write!(f, "watchdog heartbeat missed"),
            TransitionCause::HardwareFault {
                capability,
                details,
            } => write!(f, "hardware fault on {capability}: {details}"),
            TransitionCause::EmergencyStop => write!(f, "emergency stop"),
            TransitionCause::FaultCleared => write!(f, "fault cleared"),
            TransitionCause::EmergencyCleared => write!(f, "emergency cleared"),
        }
    }
}
