//! In-process simulated drivers for CI/CD testing without physical hardware.
//!
//! Every simulated device appends to a shared, ordered [`CallLog`] at the
//! moment a command is issued, so tests can assert both *whether* and *in
//! which order* capabilities were touched. Each device also hands out
//! [`SimControls`] for fault injection:
//!
//! | Control | Effect |
//! |---|---|
//! | [`SimControls::fail_next`] | the next `n` commands return `HardwareFault` |
//! | [`SimControls::set_latency`] | every command sleeps before completing |
//! | [`SimControls::set_connected`] | flips the connection flag on the status channel |
//! | [`SimControls::set_feedback_gain`] | measured power = commanded × gain |
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use pulseguard_hal::sim::SimRig;
//!
//! let rig = SimRig::new(Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(rig.hardware.energy.id(), "energy");
//! assert!(rig.log.is_empty());
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pulseguard_types::SafetyError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capability::{
    Capability, CapabilityConfig, EnergySource, Positioner, StatusSnapshot, WatchdogTimer,
};
use crate::rig::HardwareSet;

pub const ENERGY_ID: &str = "energy";
pub const POSITIONER_ID: &str = "positioner";
pub const WATCHDOG_ID: &str = "watchdog";

// ────────────────────────────────────────────────────────────────────────────
// Call log
// ────────────────────────────────────────────────────────────────────────────

/// Command issued to a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    Connect,
    Disconnect,
    SetPower(f64),
    Disable,
    MoveTo { target: f64, speed: f64 },
    Halt,
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HardwareCall {
    pub capability: String,
    pub kind: CallKind,
}

/// Ordered record of every command issued to any simulated device.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<HardwareCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HardwareCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, capability: &str, kind: CallKind) {
        self.lock().push(HardwareCall {
            capability: capability.to_string(),
            kind,
        });
    }

    pub fn calls(&self) -> Vec<HardwareCall> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Calls issued to `capability`, in order.
    pub fn for_capability(&self, capability: &str) -> Vec<CallKind> {
        self.lock()
            .iter()
            .filter(|c| c.capability == capability)
            .map(|c| c.kind.clone())
            .collect()
    }

    /// Index of the first call matching `pred` at or after `from`.
    pub fn position_from(&self, from: usize, pred: impl Fn(&HardwareCall) -> bool) -> Option<usize> {
        self.lock()
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, c)| pred(c))
            .map(|(i, _)| i)
    }

    /// Every non-zero `SetPower` with its log index.
    pub fn nonzero_power_writes(&self) -> Vec<(usize, f64)> {
        self.lock()
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c.kind {
                CallKind::SetPower(p) if p > 0.0 => Some((i, p)),
                _ => None,
            })
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared device core + controls
// ────────────────────────────────────────────────────────────────────────────

struct SimCore {
    id: String,
    log: CallLog,
    status: watch::Sender<StatusSnapshot>,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    feedback_gain_bits: AtomicU64,
}

impl SimCore {
    fn new(id: String, log: CallLog) -> Arc<Self> {
        let (status, _) = watch::channel(StatusSnapshot::disconnected());
        Arc::new(Self {
            id,
            log,
            status,
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            feedback_gain_bits: AtomicU64::new(1.0f64.to_bits()),
        })
    }

    /// Log the command, apply latency, then consume one injected failure.
    async fn issue(&self, kind: CallKind) -> Result<(), SafetyError> {
        let label = format!("{kind:?}");
        self.log.record(&self.id, kind);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SafetyError::hardware(
                &self.id,
                format!("injected failure on {label}"),
            ));
        }
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        self.status.send_modify(|s| {
            f(s);
            s.updated_at = Instant::now();
        });
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Status query: pays the latency but is neither logged nor failed.
    async fn query(&self) -> StatusSnapshot {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.snapshot()
    }

    fn feedback_gain(&self) -> f64 {
        f64::from_bits(self.feedback_gain_bits.load(Ordering::SeqCst))
    }

    async fn connect(&self) -> Result<(), SafetyError> {
        self.issue(CallKind::Connect).await?;
        self.update(|s| s.connected = true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SafetyError> {
        self.issue(CallKind::Disconnect).await?;
        self.update(|s| s.connected = false);
        Ok(())
    }
}

/// Fault-injection and inspection handle for one simulated device.
#[derive(Clone)]
pub struct SimControls {
    core: Arc<SimCore>,
}

impl SimControls {
    /// Fail the next `n` commands with `HardwareFault`.
    pub fn fail_next(&self, n: u32) {
        self.core.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every subsequent command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.core
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.core.update(|s| s.connected = connected);
    }

    /// Scale measured power relative to commanded power.
    pub fn set_feedback_gain(&self, gain: f64) {
        self.core
            .feedback_gain_bits
            .store(gain.to_bits(), Ordering::SeqCst);
        self.core.update(|s| s.measured_power = s.commanded_power * gain);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.core.snapshot()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Energy source
// ────────────────────────────────────────────────────────────────────────────

/// Simulated energy-output stage. Measured power tracks commanded power
/// scaled by the feedback gain.
pub struct SimEnergySource {
    core: Arc<SimCore>,
}

impl SimEnergySource {
    pub fn new(id: impl Into<String>, log: CallLog) -> Self {
        Self {
            core: SimCore::new(id.into(), log),
        }
    }

    pub fn controls(&self) -> SimControls {
        SimControls {
            core: Arc::clone(&self.core),
        }
    }
}

#[async_trait]
impl Capability for SimEnergySource {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn connect(&mut self, _config: &CapabilityConfig) -> Result<(), SafetyError> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> Result<(), SafetyError> {
        self.core.disconnect().await
    }

    async fn status(&mut self) -> Result<StatusSnapshot, SafetyError> {
        Ok(self.core.query().await)
    }

    fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.core.status.subscribe()
    }
}

#[async_trait]
impl EnergySource for SimEnergySource {
    async fn set_power(&mut self, power: f64) -> Result<(), SafetyError> {
        self.core.issue(CallKind::SetPower(power)).await?;
        let gain = self.core.feedback_gain();
        self.core.update(|s| {
            s.commanded_power = power;
            s.measured_power = power * gain;
        });
        Ok(())
    }

    async fn disable(&mut self) -> Result<(), SafetyError> {
        self.core.issue(CallKind::Disable).await?;
        self.core.update(|s| {
            s.commanded_power = 0.0;
            s.measured_power = 0.0;
        });
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Positioner
// ────────────────────────────────────────────────────────────────────────────

/// Interpolation step of the simulated motion task.
const MOTION_TICK: Duration = Duration::from_millis(5);

/// Simulated single-axis positioner. Motion runs on a background task and is
/// visible through the status channel.
pub struct SimPositioner {
    core: Arc<SimCore>,
    motion: Option<JoinHandle<()>>,
}

impl SimPositioner {
    pub fn new(id: impl Into<String>, log: CallLog) -> Self {
        Self {
            core: SimCore::new(id.into(), log),
            motion: None,
        }
    }

    pub fn controls(&self) -> SimControls {
        SimControls {
            core: Arc::clone(&self.core),
        }
    }

    fn stop_motion(&mut self) {
        if let Some(task) = self.motion.take() {
            task.abort();
        }
    }
}

impl Drop for SimPositioner {
    fn drop(&mut self) {
        self.stop_motion();
    }
}

#[async_trait]
impl Capability for SimPositioner {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn connect(&mut self, _config: &CapabilityConfig) -> Result<(), SafetyError> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> Result<(), SafetyError> {
        self.stop_motion();
        self.core.disconnect().await
    }

    async fn status(&mut self) -> Result<StatusSnapshot, SafetyError> {
        Ok(self.core.query().await)
    }

    fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.core.status.subscribe()
    }
}

#[async_trait]
impl Positioner for SimPositioner {
    async fn move_to(&mut self, target: f64, speed: f64) -> Result<(), SafetyError> {
        self.core.issue(CallKind::MoveTo { target, speed }).await?;
        if !(speed.is_finite() && speed > 0.0) || !target.is_finite() {
            return Err(SafetyError::hardware(
                &self.core.id,
                format!("rejected move to {target} at speed {speed}"),
            ));
        }
        self.stop_motion();

        let start = self.core.snapshot().position;
        let travel = Duration::from_secs_f64((target - start).abs() / speed);
        self.core.update(|s| s.in_motion = true);

        let core = Arc::clone(&self.core);
        self.motion = Some(tokio::spawn(async move {
            let began = Instant::now();
            loop {
                let fraction = if travel.is_zero() {
                    1.0
                } else {
                    (began.elapsed().as_secs_f64() / travel.as_secs_f64()).min(1.0)
                };
                let position = start + (target - start) * fraction;
                let done = fraction >= 1.0;
                core.update(|s| {
                    s.position = position;
                    s.in_motion = !done;
                });
                if done {
                    break;
                }
                tokio::time::sleep(MOTION_TICK).await;
            }
        }));
        Ok(())
    }

    async fn halt(&mut self) -> Result<(), SafetyError> {
        self.core.issue(CallKind::Halt).await?;
        self.stop_motion();
        self.core.update(|s| s.in_motion = false);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog timer
// ────────────────────────────────────────────────────────────────────────────

/// Observes the simulated hardware timer from outside the driver.
#[derive(Clone)]
pub struct WatchdogProbe {
    last_reset: Arc<Mutex<Option<Instant>>>,
    beats: Arc<AtomicU64>,
    hardware_timeout: Duration,
}

impl WatchdogProbe {
    fn mark(&self) {
        let mut last = match self.last_reset.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(Instant::now());
        self.beats.fetch_add(1, Ordering::SeqCst);
    }

    /// Heartbeats accepted so far.
    pub fn heartbeats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    /// `true` once the timer has been armed by a heartbeat and then left
    /// without one for longer than its hardware timeout.
    pub fn tripped(&self) -> bool {
        let last = match self.last_reset.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last.is_some_and(|t| t.elapsed() > self.hardware_timeout)
    }
}

/// Simulated external watchdog timer.
pub struct SimWatchdogTimer {
    core: Arc<SimCore>,
    probe: WatchdogProbe,
}

impl SimWatchdogTimer {
    pub fn new(id: impl Into<String>, log: CallLog, hardware_timeout: Duration) -> Self {
        Self {
            core: SimCore::new(id.into(), log),
            probe: WatchdogProbe {
                last_reset: Arc::new(Mutex::new(None)),
                beats: Arc::new(AtomicU64::new(0)),
                hardware_timeout,
            },
        }
    }

    pub fn controls(&self) -> SimControls {
        SimControls {
            core: Arc::clone(&self.core),
        }
    }

    pub fn probe(&self) -> WatchdogProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Capability for SimWatchdogTimer {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn connect(&mut self, _config: &CapabilityConfig) -> Result<(), SafetyError> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> Result<(), SafetyError> {
        self.core.disconnect().await
    }

    async fn status(&mut self) -> Result<StatusSnapshot, SafetyError> {
        Ok(self.core.query().await)
    }

    fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.core.status.subscribe()
    }
}

#[async_trait]
impl WatchdogTimer for SimWatchdogTimer {
    async fn send_heartbeat(&mut self) -> Result<(), SafetyError> {
        self.core.issue(CallKind::Heartbeat).await?;
        self.probe.mark();
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRig builder
// ────────────────────────────────────────────────────────────────────────────

/// A complete simulated bench: one of each device sharing one [`CallLog`].
pub struct SimRig {
    pub log: CallLog,
    pub energy: SimControls,
    pub positioner: SimControls,
    pub watchdog: SimControls,
    pub watchdog_probe: WatchdogProbe,
    pub hardware: HardwareSet,
}

impl SimRig {
    /// Build the bench. `call_timeout` bounds every capability call;
    /// `hardware_timeout` is the simulated watchdog's own trip time.
    pub fn new(call_timeout: Duration, hardware_timeout: Duration) -> Self {
        let log = CallLog::new();
        let energy = SimEnergySource::new(ENERGY_ID, log.clone());
        let positioner = SimPositioner::new(POSITIONER_ID, log.clone());
        let watchdog = SimWatchdogTimer::new(WATCHDOG_ID, log.clone(), hardware_timeout);

        let energy_controls = energy.controls();
        let positioner_controls = positioner.controls();
        let watchdog_controls = watchdog.controls();
        let watchdog_probe = watchdog.probe();

        let hardware = HardwareSet::new(
            Box::new(energy),
            Box::new(positioner),
            Box::new(watchdog),
            call_timeout,
        );

        Self {
            log,
            energy: energy_controls,
            positioner: positioner_controls,
            watchdog: watchdog_controls,
            watchdog_probe,
            hardware,
        }
    }
}
