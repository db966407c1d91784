//! [`SelectiveShutdownCoordinator`] – energy-only fault response.
//!
//! Registered as a [`TransitionObserver`] on the state machine, so it runs
//! inside the transition that produced the fault, before the new state is
//! visible and before the caller gets its reply.
//!
//! | Transition | Action |
//! |---|---|
//! | entering UNSAFE or EMERGENCY_STOP | `disable()` the energy stage (one retry), then publish a fault event |
//! | leaving TREATING for ARMED | `set_power(0)`, falling back to `disable()` |
//!
//! When neither call succeeds on a normal exit the coordinator returns a
//! hardware fault, which the state machine commits as a follow-up UNSAFE
//! transition. ARMED keeps the heartbeat running, so the external timer
//! would never cut a live output there.
//!
//! The positioner, the watchdog timer and every sensing path are left
//! untouched so the operator keeps diagnostics and can move the applicator
//! clear.

use async_trait::async_trait;
use chrono::Utc;
use pulseguard_hal::EnergyHandle;
use pulseguard_middleware::EventBus;
use pulseguard_types::{Event, EventPayload, FaultEvent, SafetyError, SafetyState, StateChange};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::safety_machine::TransitionObserver;

const SOURCE: &str = "pulseguard-kernel::shutdown";
const DISABLE_ATTEMPTS: u32 = 2;

/// Disables only the energy stage on fault transitions.
pub struct SelectiveShutdownCoordinator {
    energy: EnergyHandle,
    bus: EventBus,
    // Never cancelled: a shutdown in progress must not be abandoned.
    token: CancellationToken,
}

impl SelectiveShutdownCoordinator {
    pub fn new(energy: EnergyHandle, bus: EventBus) -> Self {
        Self {
            energy,
            bus,
            token: CancellationToken::new(),
        }
    }

    async fn disable_energy(&self) -> bool {
        for attempt in 1..=DISABLE_ATTEMPTS {
            match self.energy.disable(&self.token).await {
                Ok(()) => return true,
                Err(e) => warn!(
                    capability = self.energy.id(),
                    attempt,
                    error = %e,
                    "energy disable failed"
                ),
            }
        }
        error!(
            capability = self.energy.id(),
            "energy stage did not acknowledge disable"
        );
        false
    }
}

#[async_trait]
impl TransitionObserver for SelectiveShutdownCoordinator {
    async fn on_transition(&self, change: &StateChange) -> Result<(), SafetyError> {
        if change.new.is_fault() {
            let disabled = self.disable_energy().await;
            let failed_interlock = change.cause.failed_interlock().map(str::to_string);
            info!(
                state = %change.new,
                cause = %change.cause,
                failed_interlock = failed_interlock.as_deref().unwrap_or("-"),
                disabled,
                "selective shutdown"
            );
            self.bus.publish(Event::new(
                SOURCE,
                EventPayload::Fault(FaultEvent {
                    cause: change.cause.clone(),
                    failed_interlock,
                    state: change.new,
                    timestamp: Utc::now(),
                }),
            ));
        } else if change.previous == SafetyState::Treating {
            if let Err(e) = self.energy.set_power(0.0, &self.token).await {
                warn!(error = %e, "could not zero energy output after treatment");
                if !self.disable_energy().await {
                    return Err(SafetyError::hardware(
                        self.energy.id(),
                        "output still live after leaving TREATING",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety_machine::{SafetyMachineConfig, SafetyStateMachine};
    use pulseguard_hal::sim::{CallKind, ENERGY_ID, POSITIONER_ID, SimRig};
    use pulseguard_middleware::Topic;
    use pulseguard_types::{TransitionCause, VerdictSnapshot};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    fn rig() -> SimRig {
        SimRig::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    fn lost(previous: SafetyState) -> StateChange {
        StateChange {
            previous,
            new: SafetyState::Unsafe,
            cause: TransitionCause::InterlockLost {
                failed: vec!["motion_confirm".into()],
            },
        }
    }

    #[tokio::test]
    async fn fault_disables_energy_and_reports() {
        let rig = rig();
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let coordinator = SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), bus);

        coordinator.on_transition(&lost(SafetyState::Treating)).await.unwrap();

        assert_eq!(rig.log.for_capability(ENERGY_ID), vec![CallKind::Disable]);
        assert!(rig.log.for_capability(POSITIONER_ID).is_empty());

        let event = faults.try_recv().unwrap();
        match event.payload {
            EventPayload::Fault(fault) => {
                assert_eq!(fault.failed_interlock.as_deref(), Some("motion_confirm"));
                assert_eq!(fault.state, SafetyState::Unsafe);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn disable_is_retried_once() {
        let rig = rig();
        rig.energy.fail_next(1);
        let coordinator =
            SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), EventBus::default());

        coordinator.on_transition(&lost(SafetyState::Armed)).await.unwrap();
        assert_eq!(
            rig.log.for_capability(ENERGY_ID),
            vec![CallKind::Disable, CallKind::Disable]
        );
    }

    #[tokio::test]
    async fn fault_event_is_published_even_if_disable_fails() {
        let rig = rig();
        rig.energy.fail_next(5);
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let coordinator = SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), bus);

        coordinator.on_transition(&lost(SafetyState::Armed)).await.unwrap();
        assert!(faults.try_recv().is_ok());
    }

    #[tokio::test]
    async fn leaving_treatment_zeroes_power_without_fault_event() {
        let rig = rig();
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let coordinator = SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), bus);

        coordinator
            .on_transition(&StateChange {
                previous: SafetyState::Treating,
                new: SafetyState::Armed,
                cause: TransitionCause::ProtocolComplete,
            })
            .await
            .unwrap();

        assert_eq!(rig.log.for_capability(ENERGY_ID), vec![CallKind::SetPower(0.0)]);
        assert!(faults.try_recv().is_err());
    }

    #[tokio::test]
    async fn stuck_output_after_treatment_is_a_hardware_fault() {
        let rig = rig();
        rig.energy.fail_next(3);
        let coordinator =
            SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), EventBus::default());

        let err = coordinator
            .on_transition(&StateChange {
                previous: SafetyState::Treating,
                new: SafetyState::Armed,
                cause: TransitionCause::OperatorStop,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SafetyError::HardwareFault { ref capability, .. } if capability == ENERGY_ID));
        assert!(err.routes_to_unsafe());
        assert_eq!(
            rig.log.for_capability(ENERGY_ID),
            vec![CallKind::SetPower(0.0), CallKind::Disable, CallKind::Disable]
        );
    }

    #[tokio::test]
    async fn disable_fallback_after_failed_zeroing_is_enough() {
        let rig = rig();
        rig.energy.fail_next(1);
        let coordinator =
            SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), EventBus::default());

        coordinator
            .on_transition(&StateChange {
                previous: SafetyState::Treating,
                new: SafetyState::Armed,
                cause: TransitionCause::ProtocolComplete,
            })
            .await
            .unwrap();
        assert_eq!(
            rig.log.for_capability(ENERGY_ID),
            vec![CallKind::SetPower(0.0), CallKind::Disable]
        );
    }

    #[tokio::test]
    async fn non_treatment_transitions_touch_nothing() {
        let rig = rig();
        let coordinator =
            SelectiveShutdownCoordinator::new(rig.hardware.energy.clone(), EventBus::default());
        coordinator
            .on_transition(&StateChange {
                previous: SafetyState::Safe,
                new: SafetyState::Armed,
                cause: TransitionCause::OperatorArm,
            })
            .await
            .unwrap();
        assert!(rig.log.is_empty());
    }

    #[tokio::test]
    async fn emergency_stop_disables_before_reply() {
        let rig = rig();
        let bus = EventBus::default();
        let verdict = VerdictSnapshot {
            overall_satisfied: true,
            per_interlock: BTreeMap::from([("deadman".to_string(), true)]),
            sequence: 1,
            timestamp: Utc::now(),
        };
        let (_verdict_tx, verdicts) = watch::channel(verdict);
        let mut machine =
            SafetyStateMachine::new(SafetyMachineConfig::default(), verdicts, bus.clone());
        machine.add_observer(Arc::new(SelectiveShutdownCoordinator::new(
            rig.hardware.energy.clone(),
            bus,
        )));
        let (safety, _task) = machine.spawn(CancellationToken::new());

        safety.request_arm().await.unwrap();
        safety.request_emergency_stop().await.unwrap();

        assert_eq!(rig.log.for_capability(ENERGY_ID), vec![CallKind::Disable]);
        assert_eq!(safety.current_state(), SafetyState::EmergencyStop);
    }
}
