//! [`Controller`] – wires the safety core together and serves the operator
//! command channel.
//!
//! Start-up order:
//!
//! 1. validate the configuration and connect every capability,
//! 2. register the configured interlocks with the aggregator,
//! 3. build the state machine, gate the energy handle on it and register the
//!    selective shutdown observer,
//! 4. spawn the aggregator, the watchdog (own thread), the status pollers
//!    and, when a sink is given, the audit forwarder,
//! 5. create the protocol engine over the gated hardware.
//!
//! Nothing outside this module holds an ungated energy handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pulseguard_hal::{HardwareSet, StatusSnapshot, spawn_status_poller};
use pulseguard_kernel::{
    ConnectivitySource, InterlockAggregator, InterlockSource, PowerFeedbackSource, SafetyHandle,
    SafetyStateMachine, SelectiveShutdownCoordinator, TransitionOutcome, WatchdogHeartbeatService,
    WatchdogState,
};
use pulseguard_middleware::{AuditForwarder, AuditSink, EventBus, Topic, TopicReceiver};
use pulseguard_types::{
    ExecutionCursor, OperatorCommand, Protocol, SafetyError, SafetyState, VerdictSnapshot,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, InterlockClass};
use crate::engine::{ProtocolExecutionEngine, RunHandle};

/// Synchronous answer to an accepted operator command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAck {
    pub command: &'static str,
    /// State after the command was processed.
    pub state: SafetyState,
    pub detail: Option<String>,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub state: SafetyState,
    pub verdict: VerdictSnapshot,
    /// Cursor of the active or most recent run.
    pub cursor: Option<ExecutionCursor>,
    pub watchdog: WatchdogState,
}

// ────────────────────────────────────────────────────────────────────────────
// ControllerBuilder
// ────────────────────────────────────────────────────────────────────────────

/// Collects what the configuration file cannot describe: the hardware,
/// the signal lines behind hard and paired interlocks, the audit sink and
/// extra protocols.
pub struct ControllerBuilder {
    config: ControllerConfig,
    hardware: Option<HardwareSet>,
    lines: BTreeMap<String, Arc<dyn InterlockSource>>,
    audit: Option<Arc<dyn AuditSink>>,
    protocols: Vec<Protocol>,
}

impl ControllerBuilder {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            hardware: None,
            lines: BTreeMap::new(),
            audit: None,
            protocols: Vec::new(),
        }
    }

    pub fn hardware(mut self, hardware: HardwareSet) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Source for the `[[interlocks]]` entry called `name`.
    pub fn line(mut self, name: impl Into<String>, source: Arc<dyn InterlockSource>) -> Self {
        self.lines.insert(name.into(), source);
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Offer `protocol` in addition to the configured ones.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub async fn start(self) -> Result<Controller, SafetyError> {
        let hardware = self
            .hardware
            .ok_or_else(|| SafetyError::Configuration("no hardware supplied".into()))?;
        Controller::launch(self.config, hardware, self.lines, self.audit, self.protocols).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Controller
// ────────────────────────────────────────────────────────────────────────────

/// The running safety core.
pub struct Controller {
    protocols: BTreeMap<String, Protocol>,
    safety: SafetyHandle,
    engine: ProtocolExecutionEngine,
    verdicts: watch::Receiver<VerdictSnapshot>,
    watchdog: watch::Receiver<WatchdogState>,
    hardware: HardwareSet,
    bus: EventBus,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    watchdog_thread: Option<std::thread::JoinHandle<()>>,
}

impl Controller {
    /// Start with the configured protocols and no audit sink.
    pub async fn start(
        config: ControllerConfig,
        hardware: HardwareSet,
        lines: BTreeMap<String, Arc<dyn InterlockSource>>,
    ) -> Result<Self, SafetyError> {
        Self::launch(config, hardware, lines, None, Vec::new()).await
    }

    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    async fn launch(
        config: ControllerConfig,
        hardware: HardwareSet,
        lines: BTreeMap<String, Arc<dyn InterlockSource>>,
        audit: Option<Arc<dyn AuditSink>>,
        extra_protocols: Vec<Protocol>,
    ) -> Result<Self, SafetyError> {
        config.validate()?;
        let protocols = collect_protocols(&config, extra_protocols)?;
        let token = CancellationToken::new();

        hardware
            .connect_all(&config.hardware.capabilities, &token)
            .await?;

        match Self::wire(config, hardware.clone(), lines, audit, protocols, token.clone()) {
            Ok(controller) => Ok(controller),
            Err(e) => {
                warn!(error = %e, "controller start-up failed; releasing hardware");
                token.cancel();
                hardware.disconnect_all(&CancellationToken::new()).await;
                Err(e)
            }
        }
    }

    fn wire(
        config: ControllerConfig,
        hardware: HardwareSet,
        mut lines: BTreeMap<String, Arc<dyn InterlockSource>>,
        audit: Option<Arc<dyn AuditSink>>,
        protocols: BTreeMap<String, Protocol>,
        token: CancellationToken,
    ) -> Result<Self, SafetyError> {
        let bus = EventBus::default();

        // ── Interlocks ──────────────────────────────────────────────────────
        let mut aggregator = InterlockAggregator::new(config.aggregator_config(), bus.clone());
        for spec in &config.interlocks {
            let source: Arc<dyn InterlockSource> = if spec.needs_line() {
                lines.remove(&spec.name).ok_or_else(|| {
                    SafetyError::Configuration(format!(
                        "interlock '{}' needs a signal line",
                        spec.name
                    ))
                })?
            } else {
                match &spec.class {
                    InterlockClass::Connectivity { capability } => Arc::new(
                        ConnectivitySource::new(status_channel(&hardware, capability)?),
                    ),
                    _ => Arc::new(PowerFeedbackSource::new(hardware.energy.watch_status())),
                }
            };
            aggregator.add_interlock(spec.name.clone(), spec.kind(), source)?;
        }
        if let Some(name) = lines.keys().next() {
            return Err(SafetyError::Configuration(format!(
                "signal line '{name}' has no [[interlocks]] entry"
            )));
        }
        let verdicts = aggregator.subscribe();

        // ── State machine and gated hardware ────────────────────────────────
        let mut machine =
            SafetyStateMachine::new(config.safety_machine_config(), verdicts.clone(), bus.clone());
        let mut gated = hardware;
        gated.energy = gated.energy.with_permit(machine.energy_gate());
        machine.add_observer(Arc::new(SelectiveShutdownCoordinator::new(
            gated.energy.clone(),
            bus.clone(),
        )));
        let (safety, machine_task) = machine.spawn(token.clone());
        let mut tasks = vec![machine_task];

        aggregator.attach(safety.clone());
        tasks.push(aggregator.spawn(token.clone()));

        // ── Watchdog ────────────────────────────────────────────────────────
        let heartbeat = WatchdogHeartbeatService::new(
            config.watchdog_config(),
            gated.watchdog.clone(),
            safety.clone(),
        )?;
        let watchdog = heartbeat.subscribe();
        let watchdog_thread = heartbeat.spawn_dedicated(token.clone())?;

        // ── Sensing and audit ───────────────────────────────────────────────
        let period = config.status_poll();
        tasks.push(spawn_status_poller(gated.energy.clone(), period, token.clone()));
        tasks.push(spawn_status_poller(gated.positioner.clone(), period, token.clone()));
        tasks.push(spawn_status_poller(gated.watchdog.clone(), period, token.clone()));
        if let Some(sink) = audit {
            tasks.push(
                AuditForwarder::new(bus.clone(), sink)
                    .with_retry(
                        config.audit.attempts,
                        Duration::from_millis(config.audit.backoff_ms),
                    )
                    .spawn(token.clone()),
            );
        }

        let engine = ProtocolExecutionEngine::new(
            config.engine_config(),
            safety.clone(),
            verdicts.clone(),
            gated.clone(),
            bus.clone(),
            token.clone(),
        );

        info!(
            interlocks = config.interlocks.len(),
            protocols = protocols.len(),
            sample_period_ms = config.aggregator.sample_period_ms,
            heartbeat_interval_ms = config.watchdog.heartbeat_interval_ms,
            "controller started"
        );

        Ok(Self {
            protocols,
            safety,
            engine,
            verdicts,
            watchdog,
            hardware: gated,
            bus,
            token,
            tasks,
            watchdog_thread: Some(watchdog_thread),
        })
    }

    // ── Operator channel ────────────────────────────────────────────────────

    /// Dispatch one operator command. Rejections come back as errors with
    /// the state unchanged.
    pub async fn handle(&self, command: OperatorCommand) -> Result<CommandAck, SafetyError> {
        let verb = command.verb();
        info!(command = verb, state = %self.safety.current_state(), "operator command");

        let result = match command {
            OperatorCommand::Arm => self.safety.request_arm().await.map(outcome_detail),
            OperatorCommand::Start { protocol_id } => {
                self.start_protocol(&protocol_id).await.map(|run| {
                    Some(format!("protocol '{}' running", run.protocol_id()))
                })
            }
            OperatorCommand::Stop => self.engine.stop().await.map(|report| {
                report.map(|r| {
                    format!(
                        "protocol '{}' {:?} after {} line(s)",
                        r.protocol_id, r.status, r.lines_executed
                    )
                })
            }),
            OperatorCommand::Pause => self.engine.pause().await.map(cursor_detail),
            OperatorCommand::Resume => self.engine.resume().await.map(cursor_detail),
            OperatorCommand::EmergencyStop => {
                self.safety.request_emergency_stop().await.map(outcome_detail)
            }
            OperatorCommand::ClearFault => {
                self.safety.request_clear_fault().await.map(outcome_detail)
            }
            OperatorCommand::ClearEmergency => {
                self.safety.request_clear_emergency().await.map(outcome_detail)
            }
        };

        match result {
            Ok(detail) => Ok(CommandAck {
                command: verb,
                state: self.safety.current_state(),
                detail,
            }),
            Err(e) => {
                warn!(command = verb, error = %e, "operator command rejected");
                Err(e)
            }
        }
    }

    /// Start the protocol registered under `protocol_id`.
    pub async fn start_protocol(&self, protocol_id: &str) -> Result<RunHandle, SafetyError> {
        let protocol = self.protocols.get(protocol_id).cloned().ok_or_else(|| {
            SafetyError::Configuration(format!("unknown protocol '{protocol_id}'"))
        })?;
        self.engine.start(protocol).await
    }

    // ── Observation ─────────────────────────────────────────────────────────

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: self.safety.current_state(),
            verdict: self.verdicts.borrow().clone(),
            cursor: self.engine.cursor(),
            watchdog: self.watchdog.borrow().clone(),
        }
    }

    pub fn safety(&self) -> &SafetyHandle {
        &self.safety
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self, topic: Topic) -> TopicReceiver {
        self.bus.subscribe_to(topic)
    }

    pub fn protocol_ids(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    pub fn capability_status(&self) -> [(&str, StatusSnapshot); 3] {
        [
            (self.hardware.energy.id(), self.hardware.energy.last_status()),
            (
                self.hardware.positioner.id(),
                self.hardware.positioner.last_status(),
            ),
            (self.hardware.watchdog.id(), self.hardware.watchdog.last_status()),
        ]
    }

    /// Stop any run, stop every background task and disconnect the hardware.
    pub async fn shutdown(mut self) {
        if self.engine.is_running() {
            if let Err(e) = self.engine.stop().await {
                warn!(error = %e, "run did not stop cleanly during shutdown");
            }
        }
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        if let Some(thread) = self.watchdog_thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => warn!("watchdog thread ended abnormally"),
            }
        }
        self.hardware
            .disconnect_all(&CancellationToken::new())
            .await;
        debug!("controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn collect_protocols(
    config: &ControllerConfig,
    extra: Vec<Protocol>,
) -> Result<BTreeMap<String, Protocol>, SafetyError> {
    let mut protocols = BTreeMap::new();
    for protocol in config.protocols.iter().cloned().chain(extra) {
        let id = protocol.id.clone();
        if protocols.insert(id.clone(), protocol).is_some() {
            return Err(SafetyError::Configuration(format!(
                "protocol '{id}' is defined twice"
            )));
        }
    }
    Ok(protocols)
}

fn status_channel(
    hardware: &HardwareSet,
    capability: &str,
) -> Result<watch::Receiver<StatusSnapshot>, SafetyError> {
    if capability == hardware.energy.id() {
        Ok(hardware.energy.watch_status())
    } else if capability == hardware.positioner.id() {
        Ok(hardware.positioner.watch_status())
    } else if capability == hardware.watchdog.id() {
        Ok(hardware.watchdog.watch_status())
    } else {
        Err(SafetyError::Configuration(format!(
            "connectivity interlock refers to unknown capability '{capability}'"
        )))
    }
}

fn outcome_detail(outcome: TransitionOutcome) -> Option<String> {
    (!outcome.changed).then(|| format!("already {}", outcome.current))
}

fn cursor_detail(cursor: ExecutionCursor) -> Option<String> {
    let mut detail = format!(
        "line {} loop {} {:?}",
        cursor.current_line_index, cursor.loop_iteration, cursor.status
    );
    if let Some(ms) = cursor.remaining_dwell_ms {
        detail.push_str(&format!(", {ms} ms dwell left"));
    }
    Some(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterlockSpec;
    use pulseguard_hal::sim::{CallKind, ENERGY_ID, SimRig};
    use pulseguard_kernel::SignalLine;
    use pulseguard_middleware::MemoryAuditSink;
    use pulseguard_types::{EventPayload, ExecutionStatus, ProtocolAction, SafetyLimits};

    fn config() -> ControllerConfig {
        let mut cfg = ControllerConfig::default();
        cfg.aggregator.sample_period_ms = 10;
        cfg.watchdog.heartbeat_interval_ms = 20;
        cfg.watchdog.timeout_ms = 100;
        cfg.engine.poll_interval_ms = 10;
        cfg.safety.verdict_max_age_ms = Some(200);
        cfg.interlocks = vec![
            InterlockSpec {
                name: "deadman".into(),
                class: InterlockClass::Hard,
            },
            InterlockSpec {
                name: "energy_link".into(),
                class: InterlockClass::Connectivity {
                    capability: ENERGY_ID.into(),
                },
            },
        ];
        cfg
    }

    fn protocol() -> Protocol {
        Protocol::new(
            "short",
            "short",
            SafetyLimits {
                max_power: 10.0,
                min_position: 0.0,
                max_position: 100.0,
            },
        )
        .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(40))
    }

    async fn start(rig: &SimRig, deadman: &SignalLine) -> Controller {
        Controller::builder(config())
            .hardware(rig.hardware.clone())
            .line("deadman", Arc::new(deadman.clone()))
            .protocol(protocol())
            .start()
            .await
            .unwrap()
    }

    async fn settle(controller: &Controller, satisfied: bool) {
        let mut verdicts = controller.verdicts.clone();
        tokio::time::timeout(
            Duration::from_millis(500),
            verdicts.wait_for(|v| v.overall_satisfied == satisfied),
        )
        .await
        .unwrap()
        .unwrap();
    }

    fn rig() -> SimRig {
        SimRig::new(Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn arm_start_and_complete_through_commands() {
        let rig = rig();
        let deadman = SignalLine::digital(true);
        let controller = start(&rig, &deadman).await;
        settle(&controller, true).await;

        let ack = controller.handle(OperatorCommand::Arm).await.unwrap();
        assert_eq!(ack.state, SafetyState::Armed);

        let ack = controller
            .handle(OperatorCommand::Start {
                protocol_id: "short".into(),
            })
            .await
            .unwrap();
        assert_eq!(ack.state, SafetyState::Treating);

        let done = controller
            .safety()
            .wait_for(Duration::from_secs(1), |s| s == SafetyState::Armed)
            .await;
        assert_eq!(done.unwrap(), SafetyState::Armed);

        let mut completed = false;
        for _ in 0..50 {
            if controller.status().cursor.map(|c| c.status) == Some(ExecutionStatus::Completed) {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);
        assert!(!rig.log.nonzero_power_writes().is_empty());
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_arm_is_a_no_op() {
        let rig = rig();
        let deadman = SignalLine::digital(true);
        let controller = start(&rig, &deadman).await;
        settle(&controller, true).await;

        controller.handle(OperatorCommand::Arm).await.unwrap();
        let ack = controller.handle(OperatorCommand::Arm).await.unwrap();
        assert_eq!(ack.detail.as_deref(), Some("already ARMED"));
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_protocol_is_rejected() {
        let rig = rig();
        let deadman = SignalLine::digital(true);
        let controller = start(&rig, &deadman).await;
        settle(&controller, true).await;
        controller.handle(OperatorCommand::Arm).await.unwrap();

        let err = controller
            .handle(OperatorCommand::Start {
                protocol_id: "missing".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SafetyError::Configuration(_)));
        assert_eq!(controller.safety().current_state(), SafetyState::Armed);
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn energy_link_loss_faults_the_machine() {
        let rig = rig();
        let deadman = SignalLine::digital(true);
        let controller = start(&rig, &deadman).await;
        settle(&controller, true).await;
        controller.handle(OperatorCommand::Arm).await.unwrap();

        rig.energy.set_connected(false);
        let reached = controller
            .safety()
            .wait_for(Duration::from_millis(500), |s| s == SafetyState::Unsafe)
            .await;
        assert_eq!(reached.unwrap(), SafetyState::Unsafe);
        assert!(rig.log.for_capability(ENERGY_ID).contains(&CallKind::Disable));
        controller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn audit_sink_receives_state_changes() {
        let rig = rig();
        let deadman = SignalLine::digital(true);
        let sink = Arc::new(MemoryAuditSink::new());
        let controller = Controller::builder(config())
            .hardware(rig.hardware.clone())
            .line("deadman", Arc::new(deadman.clone()))
            .audit(sink.clone())
            .start()
            .await
            .unwrap();
        settle(&controller, true).await;
        controller.handle(OperatorCommand::Arm).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sink.events().iter().any(|e| matches!(
            &e.payload,
            EventPayload::StateChanged(change) if change.new == SafetyState::Armed
        )));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn missing_line_fails_start_and_releases_hardware() {
        let rig = rig();
        let err = Controller::start(config(), rig.hardware.clone(), BTreeMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SafetyError::Configuration(_)));
        assert!(!rig.energy.status().connected);
    }

    #[tokio::test]
    async fn undeclared_line_is_rejected() {
        let rig = rig();
        let lines: BTreeMap<String, Arc<dyn InterlockSource>> = BTreeMap::from([
            (
                "deadman".to_string(),
                Arc::new(SignalLine::digital(true)) as Arc<dyn InterlockSource>,
            ),
            (
                "footswitch".to_string(),
                Arc::new(SignalLine::digital(true)) as Arc<dyn InterlockSource>,
            ),
        ]);
        let err = Controller::start(config(), rig.hardware.clone(), lines)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SafetyError::Configuration(ref m) if m.contains("footswitch")));
    }

    #[tokio::test]
    async fn builder_without_hardware_is_rejected() {
        let err = Controller::builder(ControllerConfig::default())
            .start()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SafetyError::Configuration(_)));
    }
}
