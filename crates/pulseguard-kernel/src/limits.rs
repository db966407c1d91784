//! [`LimitVerifier`] – protocol line rule engine.
//!
//! Before a protocol line touches hardware, pass it through
//! [`LimitVerifier::verify_line`]. Every registered [`LimitRule`] is
//! evaluated in order; the first violation returns
//! [`SafetyError::LimitViolation`] and the line is **not** executed.
//!
//! Three built-in rules are provided:
//! - [`PowerCapRule`] – rejects energy output whose peak exceeds `max_power`.
//! - [`PositionBoundsRule`] – rejects movement targets outside
//!   `[min_position, max_position]`.
//! - [`MotionSanityRule`] – rejects non-finite values and non-positive speeds.

use pulseguard_types::{Protocol, ProtocolAction, SafetyError, SafetyLimits};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single invariant every protocol line must satisfy.
pub trait LimitRule: Send + Sync {
    /// Human-readable name used in violation messages.
    fn name(&self) -> &str;

    /// `Err(details)` when `line` violates the invariant.
    fn check(&self, line: &ProtocolAction) -> Result<(), String>;
}

// ────────────────────────────────────────────────────────────────────────────
// LimitVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Rule engine that validates protocol lines before execution.
///
/// # Example
///
/// ```
/// use pulseguard_kernel::limits::LimitVerifier;
/// use pulseguard_types::{ProtocolAction, SafetyLimits};
///
/// let verifier = LimitVerifier::from_limits(&SafetyLimits {
///     max_power: 10.0,
///     min_position: 0.0,
///     max_position: 50.0,
/// });
///
/// let ok = ProtocolAction::new().with_fixed_power(5.0).with_dwell_ms(100);
/// assert!(verifier.verify_line(0, &ok).is_ok());
///
/// let hot = ProtocolAction::new().with_fixed_power(15.0);
/// assert!(verifier.verify_line(0, &hot).is_err());
/// ```
#[derive(Default)]
pub struct LimitVerifier {
    rules: Vec<Box<dyn LimitRule>>,
}

impl LimitVerifier {
    /// Create an empty verifier with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard rule set for `limits`.
    pub fn from_limits(limits: &SafetyLimits) -> Self {
        let mut verifier = Self::new();
        verifier.add_rule(Box::new(MotionSanityRule));
        verifier.add_rule(Box::new(PowerCapRule {
            max_power: limits.max_power,
        }));
        verifier.add_rule(Box::new(PositionBoundsRule {
            min_position: limits.min_position,
            max_position: limits.max_position,
        }));
        verifier
    }

    /// Register a new [`LimitRule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn LimitRule>) {
        self.rules.push(rule);
    }

    /// Validate line `index` against every registered rule.
    pub fn verify_line(&self, index: usize, line: &ProtocolAction) -> Result<(), SafetyError> {
        for rule in &self.rules {
            rule.check(line).map_err(|details| SafetyError::LimitViolation {
                line: index,
                details: format!("{}: {details}", rule.name()),
            })?;
        }
        Ok(())
    }

    /// Validate the limits themselves, then every line of `protocol`.
    ///
    /// Returns [`SafetyError::Configuration`] for unusable limits and the
    /// first [`SafetyError::LimitViolation`] otherwise.
    pub fn verify_protocol(protocol: &Protocol) -> Result<(), SafetyError> {
        let limits = &protocol.safety_limits;
        if !limits.max_power.is_finite() || limits.max_power < 0.0 {
            return Err(SafetyError::Configuration(format!(
                "protocol '{}': max_power must be finite and non-negative",
                protocol.id
            )));
        }
        if !(limits.min_position.is_finite() && limits.max_position.is_finite())
            || limits.min_position > limits.max_position
        {
            return Err(SafetyError::Configuration(format!(
                "protocol '{}': position bounds [{}, {}] are invalid",
                protocol.id, limits.min_position, limits.max_position
            )));
        }
        let verifier = Self::from_limits(limits);
        for (index, line) in protocol.lines.iter().enumerate() {
            verifier.verify_line(index, line)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Rejects lines whose peak power exceeds `max_power`.
pub struct PowerCapRule {
    pub max_power: f64,
}

impl LimitRule for PowerCapRule {
    fn name(&self) -> &str {
        "power_cap"
    }

    fn check(&self, line: &ProtocolAction) -> Result<(), String> {
        if let Some(energy) = &line.energy {
            let peak = energy.peak_power();
            if peak > self.max_power {
                return Err(format!("power {peak} exceeds max_power {}", self.max_power));
            }
            let floor = energy.floor_power();
            if floor < 0.0 {
                return Err(format!("power {floor} is negative"));
            }
        }
        Ok(())
    }
}

/// Rejects movement targets outside `[min_position, max_position]`.
pub struct PositionBoundsRule {
    pub min_position: f64,
    pub max_position: f64,
}

impl LimitRule for PositionBoundsRule {
    fn name(&self) -> &str {
        "position_bounds"
    }

    fn check(&self, line: &ProtocolAction) -> Result<(), String> {
        if let Some(movement) = &line.movement {
            let target = movement.target_position;
            if target < self.min_position || target > self.max_position {
                return Err(format!(
                    "target_position {target} out of [{}, {}]",
                    self.min_position, self.max_position
                ));
            }
        }
        Ok(())
    }
}

/// Rejects NaN/infinite values and non-positive speeds.
pub struct MotionSanityRule;

impl LimitRule for MotionSanityRule {
    fn name(&self) -> &str {
        "motion_sanity"
    }

    fn check(&self, line: &ProtocolAction) -> Result<(), String> {
        if let Some(movement) = &line.movement {
            if !movement.target_position.is_finite() {
                return Err("target_position is not finite".into());
            }
            if !(movement.speed.is_finite() && movement.speed > 0.0) {
                return Err(format!("speed {} must be positive", movement.speed));
            }
        }
        if let Some(energy) = &line.energy {
            if !(energy.peak_power().is_finite() && energy.floor_power().is_finite()) {
                return Err("power is not finite".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulseguard_types::{EnergySpec, RampCurve};

    fn limits() -> SafetyLimits {
        SafetyLimits {
            max_power: 10.0,
            min_position: 0.0,
            max_position: 50.0,
        }
    }

    // ------------------------------------------------------------------ power

    #[test]
    fn power_at_cap_passes() {
        let v = LimitVerifier::from_limits(&limits());
        assert!(v.verify_line(0, &ProtocolAction::new().with_fixed_power(10.0)).is_ok());
    }

    #[test]
    fn power_over_cap_names_line() {
        let v = LimitVerifier::from_limits(&limits());
        let err = v
            .verify_line(3, &ProtocolAction::new().with_fixed_power(15.0))
            .unwrap_err();
        match err {
            SafetyError::LimitViolation { line, details } => {
                assert_eq!(line, 3);
                assert!(details.contains("power_cap"), "{details}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn ramp_is_checked_at_its_peak() {
        let v = LimitVerifier::from_limits(&limits());
        let ramp = ProtocolAction::new().with_energy(EnergySpec::Ramp {
            start_power: 12.0,
            end_power: 2.0,
            curve: RampCurve::EaseOut,
        });
        assert!(v.verify_line(0, &ramp).is_err());
    }

    // ------------------------------------------------------------------ position

    #[test]
    fn target_outside_bounds_fails() {
        let v = LimitVerifier::from_limits(&limits());
        assert!(v.verify_line(0, &ProtocolAction::new().with_movement(51.0, 5.0)).is_err());
        assert!(v.verify_line(0, &ProtocolAction::new().with_movement(-0.5, 5.0)).is_err());
        assert!(v.verify_line(0, &ProtocolAction::new().with_movement(50.0, 5.0)).is_ok());
    }

    #[test]
    fn zero_speed_is_rejected() {
        let v = LimitVerifier::from_limits(&limits());
        assert!(v.verify_line(0, &ProtocolAction::new().with_movement(10.0, 0.0)).is_err());
    }

    #[test]
    fn empty_line_passes() {
        let v = LimitVerifier::from_limits(&limits());
        assert!(v.verify_line(0, &ProtocolAction::new()).is_ok());
    }

    // ------------------------------------------------------------------ protocol

    #[test]
    fn verify_protocol_stops_at_first_bad_line() {
        let protocol = Protocol::new("p", "p", limits())
            .with_line(ProtocolAction::new().with_fixed_power(1.0))
            .with_line(ProtocolAction::new().with_fixed_power(20.0))
            .with_line(ProtocolAction::new().with_movement(99.0, 1.0));
        assert!(matches!(
            LimitVerifier::verify_protocol(&protocol),
            Err(SafetyError::LimitViolation { line: 1, .. })
        ));
    }

    #[test]
    fn inverted_bounds_are_a_configuration_error() {
        let protocol = Protocol::new(
            "p",
            "p",
            SafetyLimits {
                max_power: 10.0,
                min_position: 5.0,
                max_position: 1.0,
            },
        );
        assert!(matches!(
            LimitVerifier::verify_protocol(&protocol),
            Err(SafetyError::Configuration(_))
        ));
    }

    #[test]
    fn custom_rules_run_after_builtins() {
        struct NoDwellRule;
        impl LimitRule for NoDwellRule {
            fn name(&self) -> &str {
                "no_dwell"
            }
            fn check(&self, line: &ProtocolAction) -> Result<(), String> {
                match line.dwell_ms {
                    Some(_) => Err("dwell not allowed".into()),
                    None => Ok(()),
                }
            }
        }
        let mut v = LimitVerifier::from_limits(&limits());
        v.add_rule(Box::new(NoDwellRule));
        assert!(v.verify_line(0, &ProtocolAction::new().with_dwell_ms(5)).is_err());
    }
}
