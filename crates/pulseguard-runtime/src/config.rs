//! Controller configuration – reads/writes `~/.pulseguard/config.toml`.
//!
//! Every section has serde defaults, so an empty file is a valid
//! configuration with the recommended timings:
//!
//! ```toml
//! [aggregator]
//! sample_period_ms = 100
//! debounce_samples = 2
//!
//! [watchdog]
//! heartbeat_interval_ms = 500
//! timeout_ms = 1000
//!
//! [[interlocks]]
//! name = "deadman"
//! kind = "hard"
//!
//! [[interlocks]]
//! name = "motion_confirm"
//! kind = "paired_signal"
//! window_ms = 150
//!
//! [[interlocks]]
//! name = "energy_link"
//! kind = "connectivity"
//! capability = "energy"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pulseguard_hal::CapabilityConfig;
use pulseguard_kernel::{AggregatorConfig, InterlockKind, SafetyMachineConfig, WatchdogConfig};
use pulseguard_types::{Protocol, SafetyError};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    /// Oldest verdict accepted by guarded transitions. Defaults to twice the
    /// sampling period.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict_max_age_ms: Option<u64>,
    pub emergency_capacity: usize,
    pub request_capacity: usize,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            verdict_max_age_ms: None,
            emergency_capacity: 8,
            request_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSection {
    pub sample_period_ms: u64,
    pub debounce_samples: u32,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            sample_period_ms: 100,
            debounce_samples: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub poll_interval_ms: u64,
    pub cancel_budget_ms: u64,
    pub movement_timeout_ms: u64,
    pub control_timeout_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            cancel_budget_ms: 200,
            movement_timeout_ms: 10_000,
            control_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    /// Bound on every capability call.
    pub call_timeout_ms: u64,
    /// Status polling period per capability.
    pub status_poll_ms: u64,
    /// Per-capability connection settings keyed by capability id.
    pub capabilities: BTreeMap<String, CapabilityConfig>,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 250,
            status_poll_ms: 100,
            capabilities: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Interlock class with its class-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterlockClass {
    /// Deadman-style line supplied by the caller.
    Hard,
    /// Pair of lines supplied by the caller.
    PairedSignal { window_ms: u64 },
    /// Commanded vs. measured power of the energy stage.
    AnalogFeedback {
        tolerance_pct: f64,
        #[serde(default)]
        min_abs: f64,
    },
    /// Connection state of one capability.
    Connectivity { capability: String },
}

/// One `[[interlocks]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockSpec {
    pub name: String,
    #[serde(flatten)]
    pub class: InterlockClass,
}

impl InterlockSpec {
    pub fn kind(&self) -> InterlockKind {
        match &self.class {
            InterlockClass::Hard => InterlockKind::Hard,
            InterlockClass::PairedSignal { window_ms } => InterlockKind::PairedSignal {
                window: Duration::from_millis(*window_ms),
            },
            InterlockClass::AnalogFeedback {
                tolerance_pct,
                min_abs,
            } => InterlockKind::AnalogFeedback {
                tolerance_pct: *tolerance_pct,
                min_abs: *min_abs,
            },
            InterlockClass::Connectivity { .. } => InterlockKind::Connectivity,
        }
    }

    /// `true` when the caller must supply the source line.
    pub fn needs_line(&self) -> bool {
        matches!(
            self.class,
            InterlockClass::Hard | InterlockClass::PairedSignal { .. }
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ControllerConfig
// ────────────────────────────────────────────────────────────────────────────

/// Complete controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub hardware: HardwareSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub interlocks: Vec<InterlockSpec>,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

fn invalid(msg: impl Into<String>) -> SafetyError {
    SafetyError::Configuration(msg.into())
}

impl ControllerConfig {
    /// Reject inconsistent values before anything starts.
    pub fn validate(&self) -> Result<(), SafetyError> {
        if self.aggregator.sample_period_ms == 0 {
            return Err(invalid("aggregator.sample_period_ms must be non-zero"));
        }
        if !(2..=3).contains(&self.aggregator.debounce_samples) {
            return Err(invalid(format!(
                "aggregator.debounce_samples must be 2 or 3, got {}",
                self.aggregator.debounce_samples
            )));
        }
        self.watchdog_config().validate()?;
        if self.engine.poll_interval_ms == 0 || self.engine.cancel_budget_ms == 0 {
            return Err(invalid(
                "engine.poll_interval_ms and engine.cancel_budget_ms must be non-zero",
            ));
        }
        if self.hardware.call_timeout_ms == 0 || self.hardware.status_poll_ms == 0 {
            return Err(invalid(
                "hardware.call_timeout_ms and hardware.status_poll_ms must be non-zero",
            ));
        }
        if self.audit.attempts == 0 {
            return Err(invalid("audit.attempts must be at least 1"));
        }

        let mut names = BTreeSet::new();
        for spec in &self.interlocks {
            if !names.insert(spec.name.as_str()) {
                return Err(invalid(format!("interlock '{}' is configured twice", spec.name)));
            }
            if let InterlockClass::AnalogFeedback { tolerance_pct, min_abs } = &spec.class {
                if !(tolerance_pct.is_finite() && *tolerance_pct >= 0.0)
                    || !(min_abs.is_finite() && *min_abs >= 0.0)
                {
                    return Err(invalid(format!(
                        "interlock '{}': tolerances must be finite and non-negative",
                        spec.name
                    )));
                }
            }
        }

        let mut ids = BTreeSet::new();
        for protocol in &self.protocols {
            if !ids.insert(protocol.id.as_str()) {
                return Err(invalid(format!("protocol '{}' is defined twice", protocol.id)));
            }
        }
        Ok(())
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.aggregator.sample_period_ms)
    }

    pub fn verdict_max_age(&self) -> Duration {
        self.safety
            .verdict_max_age_ms
            .map(Duration::from_millis)
            .unwrap_or(self.sample_period() * 2)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware.call_timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.hardware.status_poll_ms)
    }

    pub fn safety_machine_config(&self) -> SafetyMachineConfig {
        SafetyMachineConfig {
            verdict_max_age: self.verdict_max_age(),
            emergency_capacity: self.safety.emergency_capacity,
            request_capacity: self.safety.request_capacity,
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            sample_period: self.sample_period(),
            debounce_samples: self.aggregator.debounce_samples,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_millis(self.watchdog.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.watchdog.timeout_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
            cancel_budget: Duration::from_millis(self.engine.cancel_budget_ms),
            movement_timeout: Duration::from_millis(self.engine.movement_timeout_ms),
            control_timeout: Duration::from_millis(self.engine.control_timeout_ms),
            verdict_max_age: self.verdict_max_age(),
        }
    }

    // ── Persistence ────────────────────────────────────────────────────────

    /// Load from `path` and apply environment overrides. `Ok(None)` when the
    /// file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, SafetyError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read config at {}: {e}", path.display())))?;
        let mut cfg: Self = toml::from_str(&raw)
            .map_err(|e| invalid(format!("failed to parse config at {}: {e}", path.display())))?;
        cfg.apply_env_overrides();
        Ok(Some(cfg))
    }

    /// Load from `path`, falling back to defaults (with overrides) when the
    /// file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, SafetyError> {
        match Self::load_from(path)? {
            Some(cfg) => Ok(cfg),
            None => {
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                Ok(cfg)
            }
        }
    }

    /// Write to `path`, creating the parent directory if necessary.
    pub fn save_to(&self, path: &Path) -> Result<(), SafetyError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| invalid(format!("failed to create config directory: {e}")))?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("failed to serialize config: {e}")))?;
        fs::write(path, raw)
            .map_err(|e| invalid(format!("failed to write config at {}: {e}", path.display())))
    }

    /// Apply `PULSEGUARD_*` environment overrides.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `PULSEGUARD_SAMPLE_PERIOD_MS` | `aggregator.sample_period_ms` |
    /// | `PULSEGUARD_HEARTBEAT_INTERVAL_MS` | `watchdog.heartbeat_interval_ms` |
    /// | `PULSEGUARD_WATCHDOG_TIMEOUT_MS` | `watchdog.timeout_ms` |
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// arbitrary lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(v) = read("PULSEGUARD_SAMPLE_PERIOD_MS") {
            self.aggregator.sample_period_ms = v;
        }
        if let Some(v) = read("PULSEGUARD_HEARTBEAT_INTERVAL_MS") {
            self.watchdog.heartbeat_interval_ms = v;
        }
        if let Some(v) = read("PULSEGUARD_WATCHDOG_TIMEOUT_MS") {
            self.watchdog.timeout_ms = v;
        }
    }
}

/// `~/.pulseguard/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pulseguard").join("config.toml")
}
