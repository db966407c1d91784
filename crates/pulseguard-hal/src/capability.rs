//! Capability traits for the devices the controller drives.
//!
//! | Trait | Device | Command |
//! |---|---|---|
//! | [`EnergySource`] | energy-output stage | `set_power`, `disable` |
//! | [`Positioner`] | motion axis | `move_to`, `halt` |
//! | [`WatchdogTimer`] | external hardware timer | `send_heartbeat` |
//!
//! All of them extend [`Capability`], which covers the connection lifecycle,
//! status queries and the change-notification channel.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use pulseguard_types::SafetyError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection parameters for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Device address, e.g. `"/dev/ttyUSB0"` or `"sim://energy"`.
    #[serde(default)]
    pub endpoint: String,
    /// Free-form driver parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Latest known state of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub position: f64,
    pub in_motion: bool,
    pub commanded_power: f64,
    pub measured_power: f64,
    /// Driver-reported fault text, if any.
    pub fault: Option<String>,
    pub updated_at: Instant,
}

impl StatusSnapshot {
    /// A disconnected, idle device.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            position: 0.0,
            in_motion: false,
            commanded_power: 0.0,
            measured_power: 0.0,
            fault: None,
            updated_at: Instant::now(),
        }
    }
}

/// Common surface of every hardware capability.
///
/// Drivers are owned exclusively by a
/// [`CapabilityHandle`][crate::handle::CapabilityHandle]; the `&mut self`
/// receivers are serialized by the handle's lock.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Stable identifier, e.g. `"energy"` or `"positioner"`.
    fn id(&self) -> &str;

    /// Open the device.
    ///
    /// # Errors
    ///
    /// Returns [`SafetyError::HardwareFault`] when the device cannot be
    /// reached.
    async fn connect(&mut self, config: &CapabilityConfig) -> Result<(), SafetyError>;

    async fn disconnect(&mut self) -> Result<(), SafetyError>;

    /// Query the device and return a fresh snapshot.
    async fn status(&mut self) -> Result<StatusSnapshot, SafetyError>;

    /// Change-notification channel for connection state and measured values.
    fn watch_status(&self) -> watch::Receiver<StatusSnapshot>;
}

/// The energy-output stage. The only hazardous capability.
#[async_trait]
pub trait EnergySource: Capability {
    /// Command output `power`. Zero is always an allowed value.
    async fn set_power(&mut self, power: f64) -> Result<(), SafetyError>;

    /// Remove output entirely. Must succeed even when `set_power` would not.
    async fn disable(&mut self) -> Result<(), SafetyError>;
}

/// A single motion axis.
#[async_trait]
pub trait Positioner: Capability {
    /// Begin moving to `target` at `speed` units per second.
    ///
    /// Returns once the device has acknowledged the command; motion continues
    /// in the background and is reported through [`Capability::watch_status`].
    async fn move_to(&mut self, target: f64, speed: f64) -> Result<(), SafetyError>;

    /// Stop any motion in progress, holding the current position.
    async fn halt(&mut self) -> Result<(), SafetyError>;
}

/// External timer that cuts energy output when heartbeats stop arriving.
#[async_trait]
pub trait WatchdogTimer: Capability {
    async fn send_heartbeat(&mut self) -> Result<(), SafetyError>;
}
