//! [`CapabilityHandle`] – exclusive, time-bounded access to one device.
//!
//! Each capability is owned by exactly one driver behind one
//! `tokio::sync::Mutex`. Every command goes through the handle, which
//!
//! 1. takes the device lock so a status poll and a command write never
//!    interleave,
//! 2. bounds the whole call (lock wait included) by the handle's call
//!    timeout, turning a non-returning call into
//!    [`SafetyError::HardwareFault`],
//! 3. abandons the call with [`SafetyError::OperatorAbort`] when the
//!    caller's [`CancellationToken`] fires.
//!
//! The energy handle additionally consults a [`PowerPermit`] under the
//! device lock before any non-zero `set_power` reaches the driver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pulseguard_types::SafetyError;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::capability::{
    Capability, CapabilityConfig, EnergySource, Positioner, StatusSnapshot, WatchdogTimer,
};

/// Gate consulted before the energy stage receives non-zero power.
pub trait PowerPermit: Send + Sync {
    /// `Ok` when energy output is currently allowed.
    fn check_output(&self) -> Result<(), SafetyError>;
}

/// Shared handle to one capability driver.
///
/// Clone it freely; all clones serialize on the same device lock.
pub struct CapabilityHandle<T: ?Sized> {
    id: String,
    device: Arc<Mutex<Box<T>>>,
    call_timeout: Duration,
    status: watch::Receiver<StatusSnapshot>,
    permit: Option<Arc<dyn PowerPermit>>,
}

pub type EnergyHandle = CapabilityHandle<dyn EnergySource>;
pub type PositionerHandle = CapabilityHandle<dyn Positioner>;
pub type WatchdogHandle = CapabilityHandle<dyn WatchdogTimer>;

impl<T: ?Sized> Clone for CapabilityHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            device: Arc::clone(&self.device),
            call_timeout: self.call_timeout,
            status: self.status.clone(),
            permit: self.permit.clone(),
        }
    }
}

/// Run `call` under `timeout` and `token`.
async fn guarded<R, F>(
    id: &str,
    op: &str,
    timeout: Duration,
    token: &CancellationToken,
    call: F,
) -> Result<R, SafetyError>
where
    F: Future<Output = Result<R, SafetyError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SafetyError::OperatorAbort(format!("{id}.{op} cancelled"))),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner,
            Err(_) => {
                warn!(capability = id, op, timeout_ms = timeout.as_millis() as u64, "capability call timed out");
                Err(SafetyError::hardware(
                    id,
                    format!("{op} did not return within {} ms", timeout.as_millis()),
                ))
            }
        },
    }
}

impl<T: Capability + ?Sized> CapabilityHandle<T> {
    /// Take ownership of `device`.
    pub fn new(device: Box<T>, call_timeout: Duration) -> Self {
        let id = device.id().to_string();
        let status = device.watch_status();
        Self {
            id,
            device: Arc::new(Mutex::new(device)),
            call_timeout,
            status,
            permit: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Change-notification channel captured from the driver.
    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Most recent snapshot pushed by the driver. Does not touch the device.
    pub fn last_status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub async fn connect(
        &self,
        config: &CapabilityConfig,
        token: &CancellationToken,
    ) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.connect(config).await
        };
        guarded(&self.id, "connect", self.call_timeout, token, call).await
    }

    pub async fn disconnect(&self, token: &CancellationToken) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.disconnect().await
        };
        guarded(&self.id, "disconnect", self.call_timeout, token, call).await
    }

    /// Query the device for a fresh snapshot.
    pub async fn status(&self, token: &CancellationToken) -> Result<StatusSnapshot, SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.status().await
        };
        guarded(&self.id, "status", self.call_timeout, token, call).await
    }
}

impl EnergyHandle {
    /// Attach the gate checked before every non-zero `set_power`.
    pub fn with_permit(mut self, permit: Arc<dyn PowerPermit>) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Command output `power`.
    ///
    /// Non-zero values are refused with the permit's error unless the permit
    /// allows output at the moment the device lock is held.
    pub async fn set_power(&self, power: f64, token: &CancellationToken) -> Result<(), SafetyError> {
        if !power.is_finite() || power < 0.0 {
            return Err(SafetyError::Configuration(format!(
                "power must be a finite non-negative value, got {power}"
            )));
        }
        let call = async {
            let mut device = self.device.lock().await;
            if power > 0.0 {
                if let Some(permit) = &self.permit {
                    permit.check_output()?;
                }
            }
            device.set_power(power).await
        };
        guarded(&self.id, "set_power", self.call_timeout, token, call).await
    }

    /// Remove output. Never gated.
    pub async fn disable(&self, token: &CancellationToken) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.disable().await
        };
        guarded(&self.id, "disable", self.call_timeout, token, call).await
    }
}

impl PositionerHandle {
    pub async fn move_to(
        &self,
        target: f64,
        speed: f64,
        token: &CancellationToken,
    ) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.move_to(target, speed).await
        };
        guarded(&self.id, "move_to", self.call_timeout, token, call).await
    }

    pub async fn halt(&self, token: &CancellationToken) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.halt().await
        };
        guarded(&self.id, "halt", self.call_timeout, token, call).await
    }
}

impl WatchdogHandle {
    /// Send one heartbeat, bounded by `timeout` instead of the handle's
    /// default call timeout.
    pub async fn send_heartbeat(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), SafetyError> {
        let call = async {
            let mut device = self.device.lock().await;
            device.send_heartbeat().await
        };
        guarded(&self.id, "send_heartbeat", timeout, token, call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CallKind, CallLog, SimEnergySource, SimPositioner};
    use pulseguard_types::SafetyState;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagPermit(AtomicBool);

    impl PowerPermit for FlagPermit {
        fn check_output(&self) -> Result<(), SafetyError> {
            if self.0.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SafetyError::SafetyViolation {
                    state: SafetyState::Armed,
                })
            }
        }
    }

    fn energy(log: &CallLog) -> (EnergyHandle, crate::sim::SimControls) {
        let dev = SimEnergySource::new("energy", log.clone());
        let controls = dev.controls();
        let handle: EnergyHandle = CapabilityHandle::new(Box::new(dev), Duration::from_millis(50));
        (handle, controls)
    }

    #[tokio::test]
    async fn slow_call_becomes_hardware_fault() {
        let log = CallLog::new();
        let (handle, controls) = energy(&log);
        controls.set_latency(Duration::from_millis(200));
        let token = CancellationToken::new();

        let err = handle.set_power(1.0, &token).await.unwrap_err();
        assert!(matches!(err, SafetyError::HardwareFault { ref capability, .. } if capability == "energy"));
    }

    #[tokio::test]
    async fn cancelled_call_reports_operator_abort() {
        let log = CallLog::new();
        let (handle, controls) = energy(&log);
        controls.set_latency(Duration::from_millis(30));
        let token = CancellationToken::new();
        token.cancel();

        let err = handle.disable(&token).await.unwrap_err();
        assert!(matches!(err, SafetyError::OperatorAbort(_)));
    }

    #[tokio::test]
    async fn permit_blocks_non_zero_power_only() {
        let log = CallLog::new();
        let (handle, _controls) = energy(&log);
        let permit = Arc::new(FlagPermit(AtomicBool::new(false)));
        let handle = handle.with_permit(permit.clone());
        let token = CancellationToken::new();

        let err = handle.set_power(5.0, &token).await.unwrap_err();
        assert!(matches!(err, SafetyError::SafetyViolation { .. }));
        handle.set_power(0.0, &token).await.unwrap();

        permit.0.store(true, Ordering::SeqCst);
        handle.set_power(5.0, &token).await.unwrap();

        let kinds: Vec<CallKind> = log.calls().into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallKind::SetPower(0.0), CallKind::SetPower(5.0)]);
    }

    #[tokio::test]
    async fn negative_power_is_rejected_before_the_device() {
        let log = CallLog::new();
        let (handle, _controls) = energy(&log);
        let token = CancellationToken::new();
        assert!(matches!(
            handle.set_power(-1.0, &token).await,
            Err(SafetyError::Configuration(_))
        ));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn clones_share_status_channel() {
        let log = CallLog::new();
        let dev = SimPositioner::new("positioner", log.clone());
        let handle: PositionerHandle = CapabilityHandle::new(Box::new(dev), Duration::from_millis(50));
        let other = handle.clone();
        let token = CancellationToken::new();

        handle.connect(&CapabilityConfig::default(), &token).await.unwrap();
        assert!(other.last_status().connected);
        assert_eq!(other.id(), "positioner");
    }
}
