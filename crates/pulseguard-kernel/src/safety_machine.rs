//! [`SafetyStateMachine`] – sole authority over whether energy may flow.
//!
//! The machine runs as one actor task that exclusively owns the current
//! [`SafetyState`]. Nothing else reads or writes that state directly: every
//! component talks to it through a cloned [`SafetyHandle`], whose calls are
//! funneled through two bounded queues into the actor. The actor always
//! drains the emergency queue first, so an emergency stop overtakes anything
//! already waiting in the normal queue.
//!
//! # Transition table
//!
//! | From | Request / report | Guard | To |
//! |---|---|---|---|
//! | SAFE | `request_arm` | verdict satisfied | ARMED |
//! | ARMED | `request_start` | verdict satisfied, limits pass | TREATING |
//! | TREATING | `request_stop`, `report_protocol_complete`, `report_run_aborted` | – | ARMED |
//! | any but EMERGENCY_STOP | verdict lost, `report_watchdog_missed`, `report_hardware_fault` | – | UNSAFE |
//! | UNSAFE | `request_clear_fault` | verdict satisfied | SAFE |
//! | any | `request_emergency_stop` | – | EMERGENCY_STOP |
//! | EMERGENCY_STOP | `request_clear_emergency` | verdict satisfied | SAFE |
//!
//! A request that makes no sense in the current state is rejected with
//! [`SafetyError::StateConflict`] and the state is left unchanged.
//! Repeating `request_arm` while ARMED, `request_clear_fault` while SAFE and
//! `request_stop` outside TREATING are no-op successes.
//!
//! # Commit order
//!
//! For every transition the actor, in order:
//!
//! 1. updates the [`EnergyGate`] (closed unless the new state is TREATING),
//! 2. logs the transition and publishes a `StateChanged` event,
//! 3. awaits every [`TransitionObserver`] (selective shutdown runs here),
//! 4. publishes the new state on the watch channel read by
//!    [`SafetyHandle::current_state`],
//! 5. if an observer failed with an error that routes to UNSAFE while the
//!    new state is not a fault, commits a follow-up transition to UNSAFE
//!    the same way,
//! 6. replies to the caller with the final state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pulseguard_hal::PowerPermit;
use pulseguard_middleware::EventBus;
use pulseguard_types::{
    Event, EventPayload, Protocol, SafetyError, SafetyState, StateChange, TransitionCause,
    VerdictSnapshot,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::limits::LimitVerifier;

const SOURCE: &str = "pulseguard-kernel::safety";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Tuning for the state machine actor.
#[derive(Debug, Clone)]
pub struct SafetyMachineConfig {
    /// Oldest aggregator snapshot still accepted by guarded transitions.
    pub verdict_max_age: Duration,
    pub emergency_capacity: usize,
    pub request_capacity: usize,
}

impl Default for SafetyMachineConfig {
    fn default() -> Self {
        Self {
            verdict_max_age: Duration::from_millis(200),
            emergency_capacity: 8,
            request_capacity: 64,
        }
    }
}

/// Result of a request that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: SafetyState,
    pub current: SafetyState,
    /// `false` for no-op successes.
    pub changed: bool,
}

/// Hook awaited inside the actor on every transition, before the new state
/// becomes visible to other components.
///
/// An error for which [`SafetyError::routes_to_unsafe`] holds escalates a
/// non-fault transition into UNSAFE.
#[async_trait]
pub trait TransitionObserver: Send + Sync {
    async fn on_transition(&self, change: &StateChange) -> Result<(), SafetyError>;
}

/// Energy-output permit mirrored from the actor's state.
///
/// The actor closes the gate before any observer runs and opens it only on
/// entering TREATING. The energy handle checks it under the device lock.
#[derive(Debug)]
pub struct EnergyGate {
    state: AtomicU8,
}

impl EnergyGate {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(encode(SafetyState::Safe)),
        }
    }

    fn set(&self, state: SafetyState) {
        self.state.store(encode(state), Ordering::SeqCst);
    }

    /// State the gate was last set for.
    pub fn state(&self) -> SafetyState {
        decode(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state().energy_permitted()
    }
}

impl PowerPermit for EnergyGate {
    fn check_output(&self) -> Result<(), SafetyError> {
        let state = self.state();
        if state.energy_permitted() {
            Ok(())
        } else {
            Err(SafetyError::SafetyViolation { state })
        }
    }
}

fn encode(state: SafetyState) -> u8 {
    match state {
        SafetyState::Safe => 0,
        SafetyState::Armed => 1,
        SafetyState::Treating => 2,
        SafetyState::Unsafe => 3,
        SafetyState::EmergencyStop => 4,
    }
}

fn decode(raw: u8) -> SafetyState {
    match raw {
        0 => SafetyState::Safe,
        1 => SafetyState::Armed,
        2 => SafetyState::Treating,
        3 => SafetyState::Unsafe,
        // Unknown values fail closed.
        _ => SafetyState::EmergencyStop,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Requests
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Request {
    Arm,
    Start {
        protocol_id: String,
        precheck: Result<(), SafetyError>,
    },
    Stop,
    InterlockVerdict {
        satisfied: bool,
        failed: Vec<String>,
    },
    WatchdogMissed,
    HardwareFault {
        capability: String,
        details: String,
    },
    ProtocolComplete,
    RunAborted {
        reason: String,
    },
    EmergencyStop,
    ClearFault,
    ClearEmergency,
}

impl Request {
    fn verb(&self) -> &'static str {
        match self {
            Request::Arm => "arm",
            Request::Start { .. } => "start",
            Request::Stop => "stop",
            Request::InterlockVerdict { .. } => "report interlock verdict",
            Request::WatchdogMissed => "report watchdog missed",
            Request::HardwareFault { .. } => "report hardware fault",
            Request::ProtocolComplete => "complete protocol",
            Request::RunAborted { .. } => "abort run",
            Request::EmergencyStop => "emergency stop",
            Request::ClearFault => "clear fault",
            Request::ClearEmergency => "clear emergency",
        }
    }
}

type Reply = oneshot::Sender<Result<TransitionOutcome, SafetyError>>;

struct Envelope {
    request: Request,
    reply: Reply,
}

// ────────────────────────────────────────────────────────────────────────────
// Transition function
// ────────────────────────────────────────────────────────────────────────────

/// Verdict as seen by guarded transitions.
struct Guard {
    ok: bool,
    failed: Vec<String>,
}

impl Guard {
    fn from_snapshot(snapshot: &VerdictSnapshot, max_age: Duration) -> Self {
        if snapshot.permits(max_age) {
            return Self {
                ok: true,
                failed: Vec::new(),
            };
        }
        let failed = if snapshot.sequence == 0 {
            vec!["no interlock verdict available".to_string()]
        } else if snapshot.per_interlock.is_empty() {
            vec!["no interlocks configured".to_string()]
        } else if snapshot.overall_satisfied {
            vec![format!("interlock verdict stale ({} ms old)", snapshot.age().as_millis())]
        } else {
            snapshot.failed()
        };
        Self { ok: false, failed }
    }

    fn require(&self) -> Result<(), SafetyError> {
        if self.ok {
            Ok(())
        } else {
            Err(SafetyError::InterlockViolation {
                failed: self.failed.clone(),
            })
        }
    }
}

type Decision = Result<Option<(SafetyState, TransitionCause)>, SafetyError>;

/// Pure transition function. `Ok(None)` is a no-op success.
fn decide(state: SafetyState, request: Request, guard: &Guard) -> Decision {
    use SafetyState::*;

    let to_unsafe = |cause: TransitionCause| -> Decision {
        match state {
            EmergencyStop | Unsafe => Ok(None),
            _ => Ok(Some((Unsafe, cause))),
        }
    };

    match request {
        Request::Arm => match state {
            Safe => {
                guard.require()?;
                Ok(Some((Armed, TransitionCause::OperatorArm)))
            }
            Armed => {
                guard.require()?;
                Ok(None)
            }
            _ => Err(SafetyError::state_conflict(state, "arm")),
        },
        Request::Start {
            protocol_id,
            precheck,
        } => match state {
            Armed => {
                guard.require()?;
                precheck?;
                Ok(Some((
                    Treating,
                    TransitionCause::OperatorStart {
                        protocol: protocol_id,
                    },
                )))
            }
            _ => Err(SafetyError::state_conflict(state, "start")),
        },
        Request::Stop => match state {
            Treating => Ok(Some((Armed, TransitionCause::OperatorStop))),
            _ => Ok(None),
        },
        Request::InterlockVerdict { satisfied, failed } => {
            if satisfied {
                Ok(None)
            } else {
                to_unsafe(TransitionCause::InterlockLost { failed })
            }
        }
        Request::WatchdogMissed => to_unsafe(TransitionCause::WatchdogMissed),
        Request::HardwareFault {
            capability,
            details,
        } => to_unsafe(TransitionCause::HardwareFault {
            capability,
            details,
        }),
        Request::ProtocolComplete => match state {
            Treating => Ok(Some((Armed, TransitionCause::ProtocolComplete))),
            _ => Err(SafetyError::state_conflict(state, "complete protocol")),
        },
        Request::RunAborted { reason } => match state {
            Treating => Ok(Some((Armed, TransitionCause::RunAborted { reason }))),
            _ => Ok(None),
        },
        Request::EmergencyStop => match state {
            EmergencyStop => Ok(None),
            _ => Ok(Some((EmergencyStop, TransitionCause::EmergencyStop))),
        },
        Request::ClearFault => match state {
            Unsafe => {
                guard.require()?;
                Ok(Some((Safe, TransitionCause::FaultCleared)))
            }
            Safe => Ok(None),
            _ => Err(SafetyError::state_conflict(state, "clear fault")),
        },
        Request::ClearEmergency => match state {
            EmergencyStop => {
                guard.require()?;
                Ok(Some((Safe, TransitionCause::EmergencyCleared)))
            }
            _ => Err(SafetyError::state_conflict(state, "clear emergency")),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actor
// ────────────────────────────────────────────────────────────────────────────

struct Actor {
    state: SafetyState,
    verdict_max_age: Duration,
    verdicts: watch::Receiver<VerdictSnapshot>,
    bus: EventBus,
    observers: Vec<Arc<dyn TransitionObserver>>,
    gate: Arc<EnergyGate>,
    state_tx: watch::Sender<SafetyState>,
}

impl Actor {
    async fn run(
        mut self,
        mut emergency_rx: mpsc::Receiver<Option<Reply>>,
        mut request_rx: mpsc::Receiver<Envelope>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(reply) = emergency_rx.recv() => {
                    let result = self.apply(Request::EmergencyStop).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Some(envelope) = request_rx.recv() => {
                    let result = self.apply(envelope.request).await;
                    let _ = envelope.reply.send(result);
                }
                _ = token.cancelled() => break,
                else => break,
            }
        }
        debug!(state = %self.state, "safety state machine stopped");
    }

    async fn apply(&mut self, request: Request) -> Result<TransitionOutcome, SafetyError> {
        let previous = self.state;
        let verb = request.verb();
        let guard = Guard::from_snapshot(&self.verdicts.borrow(), self.verdict_max_age);
        match decide(previous, request, &guard) {
            Err(e) => {
                warn!(state = %previous, request = verb, error = %e, "safety request rejected");
                Err(e)
            }
            Ok(None) => Ok(TransitionOutcome {
                previous,
                current: previous,
                changed: false,
            }),
            Ok(Some((next, cause))) => {
                let current = self.commit(next, cause).await;
                Ok(TransitionOutcome {
                    previous,
                    current,
                    changed: true,
                })
            }
        }
    }

    /// Commit `next` and any escalation it triggers. Returns the final state.
    async fn commit(&mut self, next: SafetyState, cause: TransitionCause) -> SafetyState {
        let mut pending = Some((next, cause));
        while let Some((next, cause)) = pending.take() {
            let previous = self.state;
            self.state = next;
            self.gate.set(next);

            if next.is_fault() {
                error!(previous = %previous, new = %next, cause = %cause, "safety state transition");
            } else {
                info!(previous = %previous, new = %next, cause = %cause, "safety state transition");
            }

            let change = StateChange {
                previous,
                new: next,
                cause,
            };
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::StateChanged(change.clone()),
            ));
            for observer in &self.observers {
                let Err(e) = observer.on_transition(&change).await else {
                    continue;
                };
                if next.is_fault() || !e.routes_to_unsafe() {
                    warn!(state = %next, error = %e, "transition observer failed");
                } else if pending.is_none() {
                    pending = Some((SafetyState::Unsafe, escalation_cause(e)));
                }
            }
            self.state_tx.send_replace(next);
        }
        self.state
    }
}

fn escalation_cause(error: SafetyError) -> TransitionCause {
    match error {
        SafetyError::HardwareFault {
            capability,
            details,
        } => TransitionCause::HardwareFault {
            capability,
            details,
        },
        SafetyError::InterlockViolation { failed } => TransitionCause::InterlockLost { failed },
        SafetyError::WatchdogTimeout { .. } => TransitionCause::WatchdogMissed,
        other => TransitionCause::HardwareFault {
            capability: "transition observer".into(),
            details: other.to_string(),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyStateMachine (builder)
// ────────────────────────────────────────────────────────────────────────────

/// Builder for the actor. Register observers, then [`spawn`][Self::spawn].
///
/// # Example
///
/// ```
/// use pulseguard_kernel::safety_machine::{SafetyMachineConfig, SafetyStateMachine};
/// use pulseguard_middleware::EventBus;
/// use pulseguard_types::{SafetyState, VerdictSnapshot};
/// use tokio::sync::watch;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (_verdict_tx, verdicts) = watch::channel(VerdictSnapshot::unavailable());
/// let machine = SafetyStateMachine::new(SafetyMachineConfig::default(), verdicts, EventBus::default());
/// let (handle, _task) = machine.spawn(CancellationToken::new());
///
/// // No verdict yet: arming is refused and the state is unchanged.
/// assert!(handle.request_arm().await.is_err());
/// assert_eq!(handle.current_state(), SafetyState::Safe);
/// # }
/// ```
pub struct SafetyStateMachine {
    config: SafetyMachineConfig,
    verdicts: watch::Receiver<VerdictSnapshot>,
    bus: EventBus,
    observers: Vec<Arc<dyn TransitionObserver>>,
    gate: Arc<EnergyGate>,
}

impl SafetyStateMachine {
    pub fn new(
        config: SafetyMachineConfig,
        verdicts: watch::Receiver<VerdictSnapshot>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            verdicts,
            bus,
            observers: Vec::new(),
            gate: Arc::new(EnergyGate::new()),
        }
    }

    /// The gate the energy handle must consult. Available before spawning so
    /// the handle can be built first.
    pub fn energy_gate(&self) -> Arc<EnergyGate> {
        Arc::clone(&self.gate)
    }

    /// Register an observer. Observers run in registration order.
    pub fn add_observer(&mut self, observer: Arc<dyn TransitionObserver>) {
        self.observers.push(observer);
    }

    /// Start the actor. It runs until `token` is cancelled or every handle
    /// has been dropped.
    pub fn spawn(self, token: CancellationToken) -> (SafetyHandle, JoinHandle<()>) {
        let (emergency_tx, emergency_rx) = mpsc::channel(self.config.emergency_capacity.max(1));
        let (request_tx, request_rx) = mpsc::channel(self.config.request_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SafetyState::Safe);

        let handle = SafetyHandle {
            emergency_tx,
            request_tx,
            state_rx,
            gate: Arc::clone(&self.gate),
        };
        let actor = Actor {
            state: SafetyState::Safe,
            verdict_max_age: self.config.verdict_max_age,
            verdicts: self.verdicts,
            bus: self.bus,
            observers: self.observers,
            gate: self.gate,
            state_tx,
        };
        let task = tokio::spawn(actor.run(emergency_rx, request_rx, token));
        (handle, task)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyHandle
// ────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable entry point into the state machine.
#[derive(Clone)]
pub struct SafetyHandle {
    emergency_tx: mpsc::Sender<Option<Reply>>,
    request_tx: mpsc::Sender<Envelope>,
    state_rx: watch::Receiver<SafetyState>,
    gate: Arc<EnergyGate>,
}

impl SafetyHandle {
    async fn call(&self, request: Request) -> Result<TransitionOutcome, SafetyError> {
        let (reply, response) = oneshot::channel();
        self.request_tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| SafetyError::Channel("safety state machine is not running".into()))?;
        response
            .await
            .map_err(|_| SafetyError::Channel("safety state machine dropped the request".into()))?
    }

    /// SAFE → ARMED. A no-op when already ARMED with a satisfied verdict.
    pub async fn request_arm(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::Arm).await
    }

    /// ARMED → TREATING for `protocol`.
    ///
    /// The protocol's lines are checked against its safety limits here; a
    /// violation is returned as [`SafetyError::LimitViolation`] and the state
    /// is unchanged.
    pub async fn request_start(&self, protocol: &Protocol) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::Start {
            protocol_id: protocol.id.clone(),
            precheck: LimitVerifier::verify_protocol(protocol),
        })
        .await
    }

    /// TREATING → ARMED. A no-op in every other state.
    pub async fn request_stop(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::Stop).await
    }

    /// Aggregated interlock verdict. `false` drives the machine to UNSAFE.
    pub async fn report_interlock_verdict(
        &self,
        satisfied: bool,
        failed: Vec<String>,
    ) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::InterlockVerdict { satisfied, failed })
            .await
    }

    pub async fn report_watchdog_missed(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::WatchdogMissed).await
    }

    /// A safety-relevant capability call failed or timed out.
    pub async fn report_hardware_fault(
        &self,
        capability: impl Into<String>,
        details: impl Into<String>,
    ) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::HardwareFault {
            capability: capability.into(),
            details: details.into(),
        })
        .await
    }

    /// TREATING → ARMED after the last line of the last loop.
    pub async fn report_protocol_complete(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::ProtocolComplete).await
    }

    /// TREATING → ARMED after the engine gave up on a run.
    pub async fn report_run_aborted(
        &self,
        reason: impl Into<String>,
    ) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::RunAborted {
            reason: reason.into(),
        })
        .await
    }

    /// ANY → EMERGENCY_STOP, ahead of every queued request.
    pub async fn request_emergency_stop(&self) -> Result<TransitionOutcome, SafetyError> {
        let (reply, response) = oneshot::channel();
        self.emergency_tx
            .send(Some(reply))
            .await
            .map_err(|_| SafetyError::Channel("safety state machine is not running".into()))?;
        response
            .await
            .map_err(|_| SafetyError::Channel("safety state machine dropped the request".into()))?
    }

    /// Non-async emergency stop for signal handlers. Does not wait for the
    /// transition; a full queue already holds an emergency stop.
    pub fn try_emergency_stop(&self) -> Result<(), SafetyError> {
        match self.emergency_tx.try_send(None) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SafetyError::Channel(
                "safety state machine is not running".into(),
            )),
        }
    }

    /// UNSAFE → SAFE. A no-op when already SAFE.
    pub async fn request_clear_fault(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::ClearFault).await
    }

    /// EMERGENCY_STOP → SAFE.
    pub async fn request_clear_emergency(&self) -> Result<TransitionOutcome, SafetyError> {
        self.call(Request::ClearEmergency).await
    }

    /// Last committed state.
    pub fn current_state(&self) -> SafetyState {
        *self.state_rx.borrow()
    }

    /// Change-notification channel for the committed state.
    pub fn subscribe_state(&self) -> watch::Receiver<SafetyState> {
        self.state_rx.clone()
    }

    pub fn energy_gate(&self) -> Arc<EnergyGate> {
        Arc::clone(&self.gate)
    }

    /// Wait until the committed state satisfies `pred`, bounded by `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(SafetyState) -> bool,
    ) -> Result<SafetyState, SafetyError> {
        let mut rx = self.state_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| pred(*s))).await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(SafetyError::Channel(
                "safety state machine is not running".into(),
            )),
            Err(_) => Err(SafetyError::Timeout(format!(
                "state condition not met within {} ms (state {})",
                timeout.as_millis(),
                self.current_state()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulseguard_middleware::Topic;
    use pulseguard_types::{ProtocolAction, SafetyLimits};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn snapshot(ok: bool) -> VerdictSnapshot {
        let mut per_interlock = BTreeMap::new();
        per_interlock.insert("door".to_string(), ok);
        VerdictSnapshot {
            overall_satisfied: ok,
            per_interlock,
            sequence: 1,
            timestamp: Utc::now(),
        }
    }

    fn protocol(power: f64) -> Protocol {
        Protocol::new(
            "p1",
            "single",
            SafetyLimits {
                max_power: 10.0,
                min_position: 0.0,
                max_position: 100.0,
            },
        )
        .with_line(ProtocolAction::new().with_fixed_power(power).with_dwell_ms(10))
    }

    struct Rig {
        verdict_tx: watch::Sender<VerdictSnapshot>,
        handle: SafetyHandle,
        bus: EventBus,
    }

    impl Rig {
        fn set_verdict(&self, ok: bool) {
            self.verdict_tx.send_replace(snapshot(ok));
        }
    }

    fn rig_with(observers: Vec<Arc<dyn TransitionObserver>>) -> Rig {
        let (verdict_tx, verdicts) = watch::channel(VerdictSnapshot::unavailable());
        let bus = EventBus::default();
        let mut machine = SafetyStateMachine::new(SafetyMachineConfig::default(), verdicts, bus.clone());
        for o in observers {
            machine.add_observer(o);
        }
        let (handle, _task) = machine.spawn(CancellationToken::new());
        Rig {
            verdict_tx,
            handle,
            bus,
        }
    }

    fn rig() -> Rig {
        rig_with(Vec::new())
    }

    // ------------------------------------------------------------------ arm

    #[tokio::test]
    async fn arm_requires_a_verdict() {
        let r = rig();
        let err = r.handle.request_arm().await.unwrap_err();
        assert!(matches!(err, SafetyError::InterlockViolation { .. }));
        assert_eq!(r.handle.current_state(), SafetyState::Safe);
    }

    #[tokio::test]
    async fn arm_names_failed_interlocks() {
        let r = rig();
        r.set_verdict(false);
        match r.handle.request_arm().await.unwrap_err() {
            SafetyError::InterlockViolation { failed } => assert_eq!(failed, vec!["door".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_verdict_is_unsatisfied() {
        let r = rig();
        let mut stale = snapshot(true);
        stale.timestamp = Utc::now() - chrono::TimeDelta::seconds(5);
        r.verdict_tx.send_replace(stale);
        assert!(r.handle.request_arm().await.is_err());
    }

    #[tokio::test]
    async fn second_arm_is_a_noop() {
        let r = rig();
        r.set_verdict(true);
        let first = r.handle.request_arm().await.unwrap();
        assert!(first.changed);
        assert_eq!(first.current, SafetyState::Armed);
        let second = r.handle.request_arm().await.unwrap();
        assert!(!second.changed);
        assert_eq!(r.handle.current_state(), SafetyState::Armed);
    }

    // ------------------------------------------------------------------ start

    #[tokio::test]
    async fn start_while_safe_is_a_state_conflict() {
        let r = rig();
        r.set_verdict(true);
        let err = r.handle.request_start(&protocol(1.0)).await.unwrap_err();
        assert!(matches!(
            err,
            SafetyError::StateConflict {
                state: SafetyState::Safe,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn start_rejects_limit_violation() {
        let r = rig();
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        let err = r.handle.request_start(&protocol(15.0)).await.unwrap_err();
        assert!(matches!(err, SafetyError::LimitViolation { line: 0, .. }));
        assert_eq!(r.handle.current_state(), SafetyState::Armed);
        assert!(!r.handle.energy_gate().is_open());
    }

    #[tokio::test]
    async fn start_opens_the_gate_and_stop_closes_it() {
        let r = rig();
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_start(&protocol(1.0)).await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Treating);
        assert!(r.handle.energy_gate().check_output().is_ok());

        r.handle.request_stop().await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Armed);
        assert!(matches!(
            r.handle.energy_gate().check_output(),
            Err(SafetyError::SafetyViolation {
                state: SafetyState::Armed
            })
        ));
    }

    #[tokio::test]
    async fn stop_outside_treating_is_a_noop() {
        let r = rig();
        let outcome = r.handle.request_stop().await.unwrap();
        assert!(!outcome.changed);
    }

    // ------------------------------------------------------------------ faults

    #[tokio::test]
    async fn lost_verdict_moves_treating_to_unsafe() {
        let r = rig();
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_start(&protocol(1.0)).await.unwrap();

        r.set_verdict(false);
        r.handle
            .report_interlock_verdict(false, vec!["door".into()])
            .await
            .unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Unsafe);

        // Clearing needs the interlocks back.
        assert!(r.handle.request_clear_fault().await.is_err());
        r.set_verdict(true);
        r.handle.request_clear_fault().await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Safe);
        assert!(!r.handle.request_clear_fault().await.unwrap().changed);
    }

    #[tokio::test]
    async fn watchdog_miss_moves_armed_to_unsafe() {
        let r = rig();
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.report_watchdog_missed().await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Unsafe);
    }

    #[tokio::test]
    async fn protocol_complete_outside_treating_is_rejected() {
        let r = rig();
        assert!(matches!(
            r.handle.report_protocol_complete().await,
            Err(SafetyError::StateConflict { .. })
        ));
    }

    // ------------------------------------------------------------------ emergency

    #[tokio::test]
    async fn emergency_stop_is_absorbing_until_cleared() {
        let r = rig();
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_emergency_stop().await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::EmergencyStop);

        assert!(matches!(
            r.handle.request_arm().await,
            Err(SafetyError::StateConflict { .. })
        ));
        r.handle.report_watchdog_missed().await.unwrap();
        assert!(matches!(
            r.handle.request_clear_fault().await,
            Err(SafetyError::StateConflict { .. })
        ));
        assert_eq!(r.handle.current_state(), SafetyState::EmergencyStop);

        r.handle.request_clear_emergency().await.unwrap();
        assert_eq!(r.handle.current_state(), SafetyState::Safe);
    }

    #[tokio::test]
    async fn try_emergency_stop_from_sync_context() {
        let r = rig();
        r.handle.try_emergency_stop().unwrap();
        let state = r
            .handle
            .wait_for(Duration::from_secs(1), |s| s == SafetyState::EmergencyStop)
            .await
            .unwrap();
        assert_eq!(state, SafetyState::EmergencyStop);
    }

    // ------------------------------------------------------------------ observers

    /// Records the public state and the gate as seen from inside the hook.
    struct Probe {
        seen: Mutex<Vec<(SafetyState, SafetyState, bool)>>,
        state_rx: Mutex<Option<watch::Receiver<SafetyState>>>,
        gate: Mutex<Option<Arc<EnergyGate>>>,
    }

    #[async_trait]
    impl TransitionObserver for Probe {
        async fn on_transition(&self, change: &StateChange) -> Result<(), SafetyError> {
            let public = self
                .state_rx
                .lock()
                .unwrap()
                .as_ref()
                .map(|rx| *rx.borrow())
                .unwrap_or_default();
            let open = self
                .gate
                .lock()
                .unwrap()
                .as_ref()
                .map(|g| g.is_open())
                .unwrap_or(false);
            self.seen.lock().unwrap().push((change.new, public, open));
            Ok(())
        }
    }

    #[tokio::test]
    async fn observers_run_before_state_is_published() {
        let probe = Arc::new(Probe {
            seen: Mutex::new(Vec::new()),
            state_rx: Mutex::new(None),
            gate: Mutex::new(None),
        });
        let r = rig_with(vec![probe.clone() as Arc<dyn TransitionObserver>]);
        *probe.state_rx.lock().unwrap() = Some(r.handle.subscribe_state());
        *probe.gate.lock().unwrap() = Some(r.handle.energy_gate());

        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_start(&protocol(1.0)).await.unwrap();
        r.handle.request_emergency_stop().await.unwrap();

        let seen = probe.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (SafetyState::Armed, SafetyState::Safe, false),
                (SafetyState::Treating, SafetyState::Armed, true),
                (SafetyState::EmergencyStop, SafetyState::Treating, false),
            ]
        );
    }

    /// Fails every transition out of TREATING, like an energy stage that
    /// will not switch off.
    struct StuckOutput;

    #[async_trait]
    impl TransitionObserver for StuckOutput {
        async fn on_transition(&self, change: &StateChange) -> Result<(), SafetyError> {
            if change.previous == SafetyState::Treating {
                Err(SafetyError::hardware("energy", "output did not reach zero"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn observer_failure_escalates_a_normal_exit_to_unsafe() {
        let r = rig_with(vec![Arc::new(StuckOutput) as Arc<dyn TransitionObserver>]);
        let mut changes = r.bus.subscribe_to(Topic::StateChanges);
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_start(&protocol(1.0)).await.unwrap();

        let outcome = r.handle.request_stop().await.unwrap();
        assert_eq!(outcome.previous, SafetyState::Treating);
        assert_eq!(outcome.current, SafetyState::Unsafe);
        assert_eq!(r.handle.current_state(), SafetyState::Unsafe);
        assert!(!r.handle.energy_gate().is_open());

        let path: Vec<(SafetyState, TransitionCause)> = changes
            .drain()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::StateChanged(c) => Some((c.new, c.cause)),
                _ => None,
            })
            .collect();
        assert_eq!(
            path[path.len() - 2..],
            [
                (SafetyState::Armed, TransitionCause::OperatorStop),
                (
                    SafetyState::Unsafe,
                    TransitionCause::HardwareFault {
                        capability: "energy".into(),
                        details: "output did not reach zero".into(),
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn observer_failure_on_a_fault_does_not_cascade() {
        let r = rig_with(vec![Arc::new(StuckOutput) as Arc<dyn TransitionObserver>]);
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();
        r.handle.request_start(&protocol(1.0)).await.unwrap();
        let outcome = r.handle.request_emergency_stop().await.unwrap();
        assert_eq!(outcome.current, SafetyState::EmergencyStop);
    }

    #[tokio::test]
    async fn transitions_are_published_on_the_bus() {
        let r = rig();
        let mut rx = r.bus.subscribe_to(Topic::StateChanges);
        r.set_verdict(true);
        r.handle.request_arm().await.unwrap();

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::StateChanged(change) => {
                assert_eq!(change.previous, SafetyState::Safe);
                assert_eq!(change.new, SafetyState::Armed);
                assert_eq!(change.cause, TransitionCause::OperatorArm);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    // ------------------------------------------------------------------ pure core

    #[test]
    fn decide_never_leaves_emergency_stop_on_faults() {
        let guard = Guard {
            ok: true,
            failed: Vec::new(),
        };
        for request in [
            Request::WatchdogMissed,
            Request::InterlockVerdict {
                satisfied: false,
                failed: vec![],
            },
            Request::HardwareFault {
                capability: "energy".into(),
                details: "x".into(),
            },
        ] {
            assert!(matches!(
                decide(SafetyState::EmergencyStop, request, &guard),
                Ok(None)
            ));
        }
    }

    #[test]
    fn unknown_gate_encoding_fails_closed() {
        assert_eq!(decode(42), SafetyState::EmergencyStop);
        for s in [
            SafetyState::Safe,
            SafetyState::Armed,
            SafetyState::Treating,
            SafetyState::Unsafe,
            SafetyState::EmergencyStop,
        ] {
            assert_eq!(decode(encode(s)), s);
        }
    }
}
