//! `pulseguard-hal` – Hardware Abstraction Layer.
//!
//! Every physical device is reached through a capability trait. The rest of
//! the controller only ever talks to the traits via a [`CapabilityHandle`],
//! so drivers can be swapped without touching safety logic.
//!
//! # Modules
//!
//! - [`capability`] – [`Capability`] base trait plus the device-specific
//!   [`EnergySource`], [`Positioner`] and [`WatchdogTimer`] traits.
//! - [`handle`] – [`CapabilityHandle`]: per-capability exclusive lock, call
//!   timeout and cancellation for every command.
//! - [`rig`] – [`HardwareSet`], the bundle of handles the controller owns.
//! - [`poller`] – one background status-polling task per capability.
//! - [`sim`] – in-process simulated drivers with an ordered call log and
//!   fault injection, for tests and the bench shell.

pub mod capability;
pub mod handle;
pub mod poller;
pub mod rig;
pub mod sim;

pub use capability::{
    Capability, CapabilityConfig, EnergySource, Positioner, StatusSnapshot, WatchdogTimer,
};
pub use handle::{CapabilityHandle, EnergyHandle, PositionerHandle, PowerPermit, WatchdogHandle};
pub use poller::spawn_status_poller;
pub use rig::HardwareSet;
