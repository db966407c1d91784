//! `pulseguard-runtime` – protocol execution and controller wiring.
//!
//! # Modules
//!
//! - [`engine`] – [`ProtocolExecutionEngine`][engine::ProtocolExecutionEngine]:
//!   drives a protocol line by line while re-checking the safety state and
//!   the interlock verdict every poll sub-interval. Pause keeps the unfinished
//!   dwell; stop and faults wind the run down within the cancellation budget.
//! - [`controller`] – [`Controller`][controller::Controller]: connects the
//!   hardware, builds the kernel components in dependency order and serves
//!   the operator command channel.
//! - [`config`] – [`ControllerConfig`][config::ControllerConfig]: TOML
//!   configuration at `~/.pulseguard/config.toml` with `PULSEGUARD_*`
//!   environment overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to enable export.
//!
//! | Component | Execution context |
//! |---|---|
//! | Safety state machine | one actor task |
//! | Interlock aggregator | one sampling task |
//! | Watchdog heartbeat | dedicated OS thread |
//! | Status pollers | one task per capability |
//! | Protocol run | one task per run |
//! | Audit forwarder | one task |

pub mod config;
pub mod controller;
pub mod engine;
pub mod telemetry;

pub use config::{ControllerConfig, InterlockClass, InterlockSpec, config_path};
pub use controller::{CommandAck, Controller, ControllerBuilder, ControllerStatus};
pub use engine::{EngineConfig, ProtocolExecutionEngine, RunHandle, RunReport};
pub use telemetry::{TracerProviderGuard, init_tracing};
