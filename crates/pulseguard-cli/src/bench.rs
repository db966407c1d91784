//! Simulated bench set-up: default interlocks, demo protocols and the signal
//! lines the shell can toggle.

use std::collections::BTreeMap;
use std::sync::Arc;

use pulseguard_hal::sim::ENERGY_ID;
use pulseguard_kernel::{InterlockSource, SignalLine};
use pulseguard_runtime::{ControllerConfig, InterlockClass, InterlockSpec};
use pulseguard_types::{EnergySpec, Protocol, ProtocolAction, RampCurve, SafetyLimits};

pub const DEADMAN: &str = "deadman";

/// Fill in what an empty configuration leaves out so the bench is usable.
pub fn with_bench_defaults(mut config: ControllerConfig) -> ControllerConfig {
    if config.interlocks.is_empty() {
        config.interlocks = vec![
            InterlockSpec {
                name: DEADMAN.into(),
                class: InterlockClass::Hard,
            },
            InterlockSpec {
                name: "energy_link".into(),
                class: InterlockClass::Connectivity {
                    capability: ENERGY_ID.into(),
                },
            },
            InterlockSpec {
                name: "power_feedback".into(),
                class: InterlockClass::AnalogFeedback {
                    tolerance_pct: 10.0,
                    min_abs: 0.5,
                },
            },
        ];
    }
    if config.protocols.is_empty() {
        config.protocols = demo_protocols();
    }
    config
}

pub fn demo_protocols() -> Vec<Protocol> {
    let limits = SafetyLimits {
        max_power: 10.0,
        min_position: 0.0,
        max_position: 100.0,
    };
    vec![
        Protocol::new("demo", "Three-point pass", limits)
            .with_line(ProtocolAction::new().with_movement(10.0, 20.0))
            .with_line(
                ProtocolAction::new()
                    .with_movement(30.0, 10.0)
                    .with_fixed_power(4.0)
                    .with_dwell_ms(2_000),
            )
            .with_line(
                ProtocolAction::new()
                    .with_energy(EnergySpec::Ramp {
                        start_power: 2.0,
                        end_power: 8.0,
                        curve: RampCurve::EaseIn,
                    })
                    .with_dwell_ms(3_000),
            ),
        Protocol::new("sweep", "Ramped sweep", limits)
            .with_line(
                ProtocolAction::new()
                    .with_movement(80.0, 15.0)
                    .with_energy(EnergySpec::Ramp {
                        start_power: 1.0,
                        end_power: 6.0,
                        curve: RampCurve::Linear,
                    }),
            )
            .with_line(ProtocolAction::new().with_movement(0.0, 40.0))
            .with_loop_count(2),
    ]
}

/// One line per interlock the caller has to drive. The deadman starts
/// released; every other line starts satisfied.
pub fn signal_lines(config: &ControllerConfig) -> BTreeMap<String, SignalLine> {
    config
        .interlocks
        .iter()
        .filter(|spec| spec.needs_line())
        .map(|spec| {
            let line = match spec.class {
                InterlockClass::PairedSignal { .. } => {
                    let line = SignalLine::paired();
                    line.assert_primary();
                    line.assert_confirm();
                    line
                }
                _ => SignalLine::digital(spec.name != DEADMAN),
            };
            (spec.name.clone(), line)
        })
        .collect()
}

pub fn as_sources(lines: &BTreeMap<String, SignalLine>) -> BTreeMap<String, Arc<dyn InterlockSource>> {
    lines
        .iter()
        .map(|(name, line)| {
            let source: Arc<dyn InterlockSource> = Arc::new(line.clone());
            (name.clone(), source)
        })
        .collect()
}

/// Drive a bench line on or off.
pub fn drive(line: &SignalLine, on: bool) {
    if line.level().is_some() {
        line.set(on);
    } else if on {
        line.assert_primary();
        line.assert_confirm();
    } else {
        line.release_confirm();
    }
}
