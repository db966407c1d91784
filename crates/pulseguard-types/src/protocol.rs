//! Treatment protocols and the execution cursor that tracks a run.
//!
//! A [`Protocol`] is an ordered list of [`ProtocolAction`] lines, each a
//! concurrent bundle of an optional movement, an optional energy output and
//! an optional dwell. Protocols arrive fully parsed from an external
//! collaborator and are immutable once execution begins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Target of a positioning move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveSpec {
    pub target_position: f64,
    /// Travel speed in position units per second. Must be positive.
    pub speed: f64,
}

/// Shape applied to a power ramp between its start and end values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampCurve {
    #[default]
    Linear,
    /// Quadratic, slow start.
    EaseIn,
    /// Quadratic, slow finish.
    EaseOut,
}

impl RampCurve {
    /// Map a progress fraction in `[0, 1]` onto the curve.
    pub fn shape(self, fraction: f64) -> f64 {
        let t = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        match self {
            RampCurve::Linear => t,
            RampCurve::EaseIn => t * t,
            RampCurve::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
        }
    }
}

/// Energy output requested by a protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EnergySpec {
    Fixed {
        power: f64,
    },
    Ramp {
        start_power: f64,
        end_power: f64,
        #[serde(default)]
        curve: RampCurve,
    },
}

impl EnergySpec {
    /// Power to command when the line starts.
    pub fn initial_power(&self) -> f64 {
        self.power_at(0.0)
    }

    /// Power at `fraction` of the line's duration.
    pub fn power_at(&self, fraction: f64) -> f64 {
        match *self {
            EnergySpec::Fixed { power } => power,
            EnergySpec::Ramp {
                start_power,
                end_power,
                curve,
            } => start_power + (end_power - start_power) * curve.shape(fraction),
        }
    }

    /// Highest power this setting can command. Compared against
    /// [`SafetyLimits::max_power`].
    pub fn peak_power(&self) -> f64 {
        match *self {
            EnergySpec::Fixed { power } => power,
            EnergySpec::Ramp {
                start_power,
                end_power,
                ..
            } => start_power.max(end_power),
        }
    }

    /// Lowest power this setting can command.
    pub fn floor_power(&self) -> f64 {
        match *self {
            EnergySpec::Fixed { power } => power,
            EnergySpec::Ramp {
                start_power,
                end_power,
                ..
            } => start_power.min(end_power),
        }
    }
}

/// One protocol line: a concurrent bundle of device actions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProtocolAction {
    #[serde(default)]
    pub movement: Option<MoveSpec>,
    #[serde(default)]
    pub energy: Option<EnergySpec>,
    /// How long the line holds. When unset the line lasts until the
    /// movement completes.
    #[serde(default)]
    pub dwell_ms: Option<u64>,
}

impl ProtocolAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_movement(mut self, target_position: f64, speed: f64) -> Self {
        self.movement = Some(MoveSpec {
            target_position,
            speed,
        });
        self
    }

    pub fn with_energy(mut self, energy: EnergySpec) -> Self {
        self.energy = Some(energy);
        self
    }

    pub fn with_fixed_power(self, power: f64) -> Self {
        self.with_energy(EnergySpec::Fixed { power })
    }

    pub fn with_dwell_ms(mut self, dwell_ms: u64) -> Self {
        self.dwell_ms = Some(dwell_ms);
        self
    }

    pub fn dwell(&self) -> Option<Duration> {
        self.dwell_ms.map(Duration::from_millis)
    }
}

/// Hard bounds every line of a protocol must respect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_power: f64,
    #[serde(default)]
    pub min_position: f64,
    pub max_position: f64,
}

impl SafetyLimits {
    /// `true` when `position` lies in `[min_position, max_position]`.
    pub fn contains_position(&self, position: f64) -> bool {
        position.is_finite() && position >= self.min_position && position <= self.max_position
    }
}

fn default_loop_count() -> u32 {
    1
}

/// An operator-selectable treatment protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    /// Identifier the operator uses in `start(protocolId)`.
    pub id: String,
    pub name: String,
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,
    #[serde(default)]
    pub lines: Vec<ProtocolAction>,
    pub safety_limits: SafetyLimits,
}

impl Protocol {
    pub fn new(id: impl Into<String>, name: impl Into<String>, safety_limits: SafetyLimits) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            loop_count: default_loop_count(),
            lines: Vec::new(),
            safety_limits,
        }
    }

    pub fn with_line(mut self, line: ProtocolAction) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    /// Number of lines a complete run executes.
    pub fn total_lines(&self) -> usize {
        self.lines.len() * self.loop_count as usize
    }
}

/// Lifecycle of a protocol run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Aborted,
    Completed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Aborted | ExecutionStatus::Completed)
    }
}

/// Position of a run within its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionCursor {
    pub current_line_index: usize,
    pub loop_iteration: u32,
    pub status: ExecutionStatus,
    /// Dwell left on the current line. Populated while paused.
    #[serde(default)]
    pub remaining_dwell_ms: Option<u64>,
}
