//! [`HardwareSet`] – the controller's bundle of capability handles.
//!
//! The set owns one handle per device class and is the only place where
//! drivers are connected and disconnected as a group. Connection parameters
//! are looked up by capability id; a missing entry connects with
//! [`CapabilityConfig::default`].

use std::collections::BTreeMap;
use std::time::Duration;

use pulseguard_types::SafetyError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capability::{CapabilityConfig, EnergySource, Positioner, WatchdogTimer};
use crate::handle::{CapabilityHandle, EnergyHandle, PositionerHandle, WatchdogHandle};

/// Handles for every device the controller drives.
#[derive(Clone)]
pub struct HardwareSet {
    pub energy: EnergyHandle,
    pub positioner: PositionerHandle,
    pub watchdog: WatchdogHandle,
}

impl HardwareSet {
    /// Wrap three drivers in handles sharing one call timeout.
    pub fn new(
        energy: Box<dyn EnergySource>,
        positioner: Box<dyn Positioner>,
        watchdog: Box<dyn WatchdogTimer>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            energy: CapabilityHandle::new(energy, call_timeout),
            positioner: CapabilityHandle::new(positioner, call_timeout),
            watchdog: CapabilityHandle::new(watchdog, call_timeout),
        }
    }

    /// Identifiers in connection order.
    pub fn ids(&self) -> [&str; 3] {
        [self.energy.id(), self.positioner.id(), self.watchdog.id()]
    }

    /// Connect every device.
    ///
    /// # Errors
    ///
    /// Returns the first connection failure. Devices connected before the
    /// failure stay connected.
    pub async fn connect_all(
        &self,
        configs: &BTreeMap<String, CapabilityConfig>,
        token: &CancellationToken,
    ) -> Result<(), SafetyError> {
        let default = CapabilityConfig::default();
        let lookup = |id: &str| configs.get(id).unwrap_or(&default);

        self.energy.connect(lookup(self.energy.id()), token).await?;
        self.positioner
            .connect(lookup(self.positioner.id()), token)
            .await?;
        self.watchdog.connect(lookup(self.watchdog.id()), token).await?;
        info!(capabilities = ?self.ids(), "hardware connected");
        Ok(())
    }

    /// Disconnect every device, energy stage first. Failures are logged and
    /// do not stop the remaining disconnects.
    pub async fn disconnect_all(&self, token: &CancellationToken) {
        if let Err(e) = self.energy.disable(token).await {
            warn!(capability = self.energy.id(), error = %e, "disable before disconnect failed");
        }
        let results = [
            (self.energy.id(), self.energy.disconnect(token).await),
            (self.positioner.id(), self.positioner.disconnect(token).await),
            (self.watchdog.id(), self.watchdog.disconnect(token).await),
        ];
        for (id, result) in results {
            if let Err(e) = result {
                warn!(capability = id, error = %e, "disconnect failed");
            }
        }
    }
}
