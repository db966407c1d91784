//! `pulseguard-kernel` – Safety & Orchestration
//!
//! The safety core. It does not execute treatments; it decides whether energy
//! delivery is permitted and enforces that decision.
//!
//! # Modules
//!
//! - [`safety_machine`] – [`SafetyStateMachine`][safety_machine::SafetyStateMachine]:
//!   the actor that exclusively owns [`SafetyState`][pulseguard_types::SafetyState]
//!   and serializes every request and report through one queue pair.
//! - [`interlock`] – [`InterlockAggregator`][interlock::InterlockAggregator]:
//!   samples every configured interlock source on a fixed period and
//!   publishes one combined verdict.
//! - [`debounce`] – [`Debouncer`][debounce::Debouncer]: the one filter
//!   primitive applied to every interlock.
//! - [`watchdog`] – [`WatchdogHeartbeatService`][watchdog::WatchdogHeartbeatService]:
//!   keeps the external hardware timer reset while energy may be delivered.
//! - [`shutdown`] – [`SelectiveShutdownCoordinator`][shutdown::SelectiveShutdownCoordinator]:
//!   disables only the energy stage on every fault transition.
//! - [`limits`] – [`LimitVerifier`][limits::LimitVerifier]: rule engine that
//!   validates protocol lines against their safety limits before any
//!   hardware call.

pub mod debounce;
pub mod interlock;
pub mod limits;
pub mod safety_machine;
pub mod shutdown;
pub mod watchdog;

pub use debounce::{DebouncePolicy, Debouncer};
pub use interlock::{
    AggregatorConfig, ConnectivitySource, InterlockAggregator, InterlockKind, InterlockRecord, InterlockSource,
    PowerFeedbackSource, SignalLine, SignalSample, SignalValue,
};
pub use limits::{LimitRule, LimitVerifier, MotionSanityRule, PositionBoundsRule, PowerCapRule};
pub use safety_machine::{
    EnergyGate, SafetyHandle, SafetyMachineConfig, SafetyStateMachine, TransitionObserver,
    TransitionOutcome,
};
pub use shutdown::SelectiveShutdownCoordinator;
pub use watchdog::{WatchdogConfig, WatchdogHeartbeatService, WatchdogState};
