//! [`InterlockAggregator`] – one combined verdict from every interlock.
//!
//! Each configured interlock pairs an [`InterlockKind`] with an
//! [`InterlockSource`]. On every sampling tick the aggregator reads every
//! source, evaluates the raw sample for its kind, filters it through the
//! interlock's [`Debouncer`] and combines the results into a
//! [`VerdictSnapshot`].
//!
//! | Kind | Raw condition | Debounce |
//! |---|---|---|
//! | [`InterlockKind::Hard`] | digital level is asserted | instant |
//! | [`InterlockKind::PairedSignal`] | both signals asserted within `window` | N samples |
//! | [`InterlockKind::AnalogFeedback`] | measured within tolerance of commanded | N samples |
//! | [`InterlockKind::Connectivity`] | capability reports connected | instant |
//!
//! Fail-closed everywhere: a missing sample, a sample older than twice the
//! sampling period, a value of the wrong shape and an empty interlock set
//! all count as unsatisfied.
//!
//! Every snapshot is published on a `watch` channel (read by the state
//! machine's guards) and on the interlock-status bus lane. When the overall
//! verdict flips the aggregator also pushes it into the state machine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use pulseguard_hal::StatusSnapshot;
use pulseguard_middleware::EventBus;
use pulseguard_types::{Event, EventPayload, SafetyError, VerdictSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::debounce::{DebouncePolicy, Debouncer};
use crate::safety_machine::SafetyHandle;

const SOURCE: &str = "pulseguard-kernel::interlock";

// ────────────────────────────────────────────────────────────────────────────
// Kinds, samples, sources
// ────────────────────────────────────────────────────────────────────────────

/// Interlock class. Decides how a raw sample is judged and debounced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterlockKind {
    /// Deadman-style level. No debounce in either direction.
    Hard,
    /// Two independent signals that must both be asserted within `window`
    /// of each other.
    PairedSignal { window: Duration },
    /// Commanded vs. measured value. Passes when the difference is within
    /// `tolerance_pct` of the commanded value, or within `min_abs` for small
    /// commands.
    AnalogFeedback { tolerance_pct: f64, min_abs: f64 },
    /// Capability connection state. No debounce.
    Connectivity,
}

impl InterlockKind {
    /// Filter policy for this class given the configured sample count.
    pub fn debounce_policy(&self, samples: u32) -> DebouncePolicy {
        match self {
            InterlockKind::Hard | InterlockKind::Connectivity => DebouncePolicy::Instant,
            InterlockKind::PairedSignal { .. } | InterlockKind::AnalogFeedback { .. } => {
                DebouncePolicy::Consecutive(samples)
            }
        }
    }

    fn evaluate(&self, value: &SignalValue) -> bool {
        match (self, value) {
            (InterlockKind::Hard, SignalValue::Digital(level)) => *level,
            (
                InterlockKind::PairedSignal { window },
                SignalValue::Paired {
                    primary: Some(a),
                    confirm: Some(b),
                },
            ) => a.max(b).duration_since(*a.min(b)) <= *window,
            (
                InterlockKind::AnalogFeedback {
                    tolerance_pct,
                    min_abs,
                },
                SignalValue::Analog { commanded, measured },
            ) => {
                if !(commanded.is_finite() && measured.is_finite()) {
                    return false;
                }
                let allowed = (commanded.abs() * tolerance_pct / 100.0).max(*min_abs);
                (commanded - measured).abs() <= allowed
            }
            (InterlockKind::Connectivity, SignalValue::Connected(connected)) => *connected,
            _ => false,
        }
    }
}

/// Raw value read from a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    Digital(bool),
    Paired {
        primary: Option<Instant>,
        confirm: Option<Instant>,
    },
    Analog {
        commanded: f64,
        measured: f64,
    },
    Connected(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub value: SignalValue,
    pub observed_at: Instant,
}

impl SignalSample {
    pub fn now(value: SignalValue) -> Self {
        Self {
            value,
            observed_at: Instant::now(),
        }
    }
}

/// Something the aggregator can sample. `None` means the source has nothing
/// to report, which counts as failed.
pub trait InterlockSource: Send + Sync {
    fn read(&self) -> Option<SignalSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    /// Current level, always fresh while attached.
    Level,
    /// Last pushed sample with its own timestamp.
    Pushed,
}

#[derive(Debug)]
struct LineState {
    value: Option<SignalValue>,
    stamped: Instant,
}

/// An input line driven by an external collaborator (operator switch, door
/// contact, motion sensor).
#[derive(Debug, Clone)]
pub struct SignalLine {
    mode: LineMode,
    state: Arc<Mutex<LineState>>,
}

impl SignalLine {
    fn with(mode: LineMode, value: Option<SignalValue>) -> Self {
        Self {
            mode,
            state: Arc::new(Mutex::new(LineState {
                value,
                stamped: Instant::now(),
            })),
        }
    }

    /// Level-driven digital line.
    pub fn digital(initial: bool) -> Self {
        Self::with(LineMode::Level, Some(SignalValue::Digital(initial)))
    }

    /// Level-driven pair of signals, both initially released.
    pub fn paired() -> Self {
        Self::with(
            LineMode::Level,
            Some(SignalValue::Paired {
                primary: None,
                confirm: None,
            }),
        )
    }

    /// Push-driven line. Reads return the last pushed sample and go stale
    /// when the producer stops pushing.
    pub fn pushed() -> Self {
        Self::with(LineMode::Pushed, None)
    }

    fn lock(&self) -> MutexGuard<'_, LineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the current value.
    pub fn push(&self, value: SignalValue) {
        let mut state = self.lock();
        state.value = Some(value);
        state.stamped = Instant::now();
    }

    /// Drive a digital level.
    pub fn set(&self, level: bool) {
        self.push(SignalValue::Digital(level));
    }

    fn modify_pair(&self, f: impl FnOnce(&mut Option<Instant>, &mut Option<Instant>)) {
        let mut state = self.lock();
        let (mut primary, mut confirm) = match state.value {
            Some(SignalValue::Paired { primary, confirm }) => (primary, confirm),
            _ => (None, None),
        };
        f(&mut primary, &mut confirm);
        state.value = Some(SignalValue::Paired { primary, confirm });
        state.stamped = Instant::now();
    }

    pub fn assert_primary(&self) {
        self.modify_pair(|p, _| *p = Some(Instant::now()));
    }

    pub fn assert_confirm(&self) {
        self.modify_pair(|_, c| *c = Some(Instant::now()));
    }

    pub fn release_primary(&self) {
        self.modify_pair(|p, _| *p = None);
    }

    pub fn release_confirm(&self) {
        self.modify_pair(|_, c| *c = None);
    }

    /// Simulate a disconnected input: subsequent reads return `None`.
    pub fn detach(&self) {
        self.lock().value = None;
    }

    /// Current digital level, if the line carries one.
    pub fn level(&self) -> Option<bool> {
        match self.lock().value {
            Some(SignalValue::Digital(level)) => Some(level),
            _ => None,
        }
    }
}

impl InterlockSource for SignalLine {
    fn read(&self) -> Option<SignalSample> {
        let state = self.lock();
        let value = state.value?;
        let observed_at = match self.mode {
            LineMode::Level => Instant::now(),
            LineMode::Pushed => state.stamped,
        };
        Some(SignalSample { value, observed_at })
    }
}

/// Connection state of a capability, read from its status channel.
pub struct ConnectivitySource {
    status: watch::Receiver<StatusSnapshot>,
}

impl ConnectivitySource {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        Self { status }
    }
}

impl InterlockSource for ConnectivitySource {
    fn read(&self) -> Option<SignalSample> {
        // A dropped driver is a lost device.
        self.status.has_changed().ok()?;
        Some(SignalSample::now(SignalValue::Connected(
            self.status.borrow().connected,
        )))
    }
}

/// Commanded vs. measured output of the energy stage.
pub struct PowerFeedbackSource {
    status: watch::Receiver<StatusSnapshot>,
}

impl PowerFeedbackSource {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        Self { status }
    }
}

impl InterlockSource for PowerFeedbackSource {
    fn read(&self) -> Option<SignalSample> {
        self.status.has_changed().ok()?;
        let status = self.status.borrow();
        Some(SignalSample::now(SignalValue::Analog {
            commanded: status.commanded_power,
            measured: status.measured_power,
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Records
// ────────────────────────────────────────────────────────────────────────────

/// Per-interlock state. Mutated only by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct InterlockRecord {
    pub name: String,
    pub kind: InterlockKind,
    /// Debounced verdict.
    pub satisfied: bool,
    /// When the source last produced a sample.
    pub last_updated: Option<Instant>,
    /// Raw failing samples in a row.
    pub consecutive_fail_count: u32,
}

struct Entry {
    record: InterlockRecord,
    source: Arc<dyn InterlockSource>,
    debouncer: Debouncer,
}

// ────────────────────────────────────────────────────────────────────────────
// InterlockAggregator
// ────────────────────────────────────────────────────────────────────────────

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub sample_period: Duration,
    /// Consecutive samples required by debounced classes.
    pub debounce_samples: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(100),
            debounce_samples: 2,
        }
    }
}

/// Samples every interlock and publishes one combined verdict.
pub struct InterlockAggregator {
    config: AggregatorConfig,
    entries: Vec<Entry>,
    sequence: u64,
    last_overall: bool,
    verdict_tx: watch::Sender<VerdictSnapshot>,
    bus: EventBus,
    safety: Option<SafetyHandle>,
}

impl InterlockAggregator {
    pub fn new(config: AggregatorConfig, bus: EventBus) -> Self {
        let (verdict_tx, _) = watch::channel(VerdictSnapshot::unavailable());
        Self {
            config,
            entries: Vec::new(),
            sequence: 0,
            last_overall: false,
            verdict_tx,
            bus,
            safety: None,
        }
    }

    /// Register an interlock. Names must be unique.
    pub fn add_interlock(
        &mut self,
        name: impl Into<String>,
        kind: InterlockKind,
        source: Arc<dyn InterlockSource>,
    ) -> Result<(), SafetyError> {
        let name = name.into();
        if self.entries.iter().any(|e| e.record.name == name) {
            return Err(SafetyError::Configuration(format!(
                "interlock '{name}' is configured twice"
            )));
        }
        let debouncer = Debouncer::new(kind.debounce_policy(self.config.debounce_samples));
        self.entries.push(Entry {
            record: InterlockRecord {
                name,
                kind,
                satisfied: false,
                last_updated: None,
                consecutive_fail_count: 0,
            },
            source,
            debouncer,
        });
        Ok(())
    }

    /// Push overall-verdict changes into `safety`.
    pub fn attach(&mut self, safety: SafetyHandle) {
        self.safety = Some(safety);
    }

    /// Latest-snapshot channel for the state machine's guards.
    pub fn subscribe(&self) -> watch::Receiver<VerdictSnapshot> {
        self.verdict_tx.subscribe()
    }

    pub fn records(&self) -> Vec<InterlockRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    /// Samples older than this are treated as failed.
    pub fn stale_after(&self) -> Duration {
        self.config.sample_period * 2
    }

    /// Take one sample of every interlock and publish the result.
    pub async fn sample(&mut self) -> VerdictSnapshot {
        let now = Instant::now();
        let stale_after = self.stale_after();
        let mut per_interlock = BTreeMap::new();

        for entry in &mut self.entries {
            let sample = entry.source.read();
            let raw = match &sample {
                Some(s) if now.saturating_duration_since(s.observed_at) <= stale_after => {
                    entry.record.kind.evaluate(&s.value)
                }
                _ => false,
            };
            if let Some(s) = &sample {
                entry.record.last_updated = Some(s.observed_at);
            }
            entry.record.consecutive_fail_count = if raw {
                0
            } else {
                entry.record.consecutive_fail_count.saturating_add(1)
            };

            let satisfied = entry.debouncer.update(raw);
            if satisfied != entry.record.satisfied {
                if satisfied {
                    info!(interlock = %entry.record.name, "interlock satisfied");
                } else {
                    warn!(
                        interlock = %entry.record.name,
                        consecutive_failures = entry.record.consecutive_fail_count,
                        "interlock lost"
                    );
                }
            }
            entry.record.satisfied = satisfied;
            per_interlock.insert(entry.record.name.clone(), satisfied);
        }

        let overall = !self.entries.is_empty() && per_interlock.values().all(|ok| *ok);
        self.sequence += 1;
        let snapshot = VerdictSnapshot {
            overall_satisfied: overall,
            per_interlock,
            sequence: self.sequence,
            timestamp: Utc::now(),
        };

        self.verdict_tx.send_replace(snapshot.clone());
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::InterlockStatus(snapshot.clone()),
        ));

        if overall != self.last_overall {
            self.last_overall = overall;
            let failed = snapshot.failed();
            debug!(overall, ?failed, sequence = self.sequence, "overall interlock verdict changed");
            if let Some(safety) = &self.safety {
                if let Err(e) = safety.report_interlock_verdict(overall, failed).await {
                    warn!(error = %e, "could not deliver interlock verdict");
                }
            }
        }
        snapshot
    }

    /// Run the fixed-period sampling loop until `token` is cancelled.
    pub fn spawn(mut self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sample_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interlocks = self.entries.len(),
                period_ms = self.config.sample_period.as_millis() as u64,
                "interlock aggregator started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sample().await;
                    }
                }
            }
            debug!("interlock aggregator stopped");
        })
    }
}
