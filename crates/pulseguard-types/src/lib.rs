//! `pulseguard-types` – shared vocabulary of the PulseGuard safety core.
//!
//! Every other crate in the workspace speaks in these types: the operating
//! [`SafetyState`], the [`Protocol`] an operator runs, the [`Event`] envelope
//! routed over the bus, and the single [`SafetyError`] taxonomy.

pub mod command;
pub mod error;
pub mod event;
pub mod protocol;
pub mod state;

pub use command::OperatorCommand;
pub use error::SafetyError;
pub use event::{Event, EventPayload, FaultEvent, ProgressUpdate, StateChange, VerdictSnapshot};
pub use protocol::{
    EnergySpec, ExecutionCursor, ExecutionStatus, MoveSpec, Protocol, ProtocolAction, RampCurve,
    SafetyLimits,
};
pub use state::{SafetyState, TransitionCause};
