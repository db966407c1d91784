//! [`ProtocolExecutionEngine`] – runs a protocol line by line under
//! continuous safety re-validation.
//!
//! # Per-line algorithm
//!
//! For every loop iteration and every line the run task:
//!
//! 1. requires the energy gate to be in TREATING, otherwise aborts with
//!    [`SafetyError::SafetyViolation`],
//! 2. re-checks the line against the protocol's limits, aborting with
//!    [`SafetyError::LimitViolation`] before any hardware call,
//! 3. sets the energy level (0 when the line has no energy spec), then
//!    starts the movement,
//! 4. holds for the line's dwell, or until the positioner settles when no
//!    dwell is given, polling the gate and the latest interlock verdict
//!    every `poll_interval` and re-evaluating ramps as it goes. A move still
//!    under way when the dwell ends is halted.
//!
//! # Faults
//!
//! Whatever ends a run early is first escalated to the state machine so the
//! selective shutdown runs inside that transition. Errors for which
//! [`SafetyError::routes_to_unsafe`] holds become a failing verdict, a
//! missed heartbeat or a hardware fault; limit and configuration errors
//! abort the run back to ARMED. Only then does the run wind down: power to
//! zero (falling back to `disable`) and positioner halt, bounded by the
//! cancellation budget. A wind-down that cannot stop the output, or that
//! overruns the budget, is escalated in turn and replaces the run's error.
//!
//! # Pause and resume
//!
//! A pause is honoured during a dwell or at the next line boundary, never in
//! the middle of a hardware call. It forces power to zero and keeps the
//! unfinished dwell. A pause that waits for a line boundary is dropped if its
//! caller has stopped waiting, so a request reported as timed out never
//! takes effect later. Resume re-validates the state and the current line's
//! limits, restores the line's power and holds only for the remaining
//! dwell.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pulseguard_hal::HardwareSet;
use pulseguard_kernel::{EnergyGate, LimitVerifier, SafetyHandle};
use pulseguard_middleware::EventBus;
use pulseguard_types::{
    EnergySpec, Event, EventPayload, ExecutionCursor, ExecutionStatus, ProgressUpdate, Protocol,
    ProtocolAction, SafetyError, SafetyState, VerdictSnapshot,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "pulseguard-runtime::engine";

/// Distance from the target at which a stopped positioner counts as settled.
const SETTLE_TOLERANCE: f64 = 1e-3;

/// Smallest ramp step worth a `set_power` call.
const RAMP_STEP: f64 = 1e-3;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Engine timing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Safety poll sub-interval during dwells and settle waits.
    pub poll_interval: Duration,
    /// Upper bound for winding a run down after it stops.
    pub cancel_budget: Duration,
    /// Longest a line without dwell may wait for the positioner to settle.
    pub movement_timeout: Duration,
    /// How long pause and resume wait for the run to acknowledge.
    pub control_timeout: Duration,
    /// Oldest interlock verdict accepted while treating.
    pub verdict_max_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            cancel_budget: Duration::from_millis(200),
            movement_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(1),
            verdict_max_age: Duration::from_millis(200),
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub protocol_id: String,
    pub status: ExecutionStatus,
    pub cursor: ExecutionCursor,
    pub lines_executed: usize,
    /// Why the run stopped early.
    pub error: Option<SafetyError>,
}

/// Caller-side view of one run.
pub struct RunHandle {
    protocol_id: String,
    cursor: watch::Receiver<ExecutionCursor>,
    report: watch::Receiver<Option<RunReport>>,
}

impl RunHandle {
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn cursor(&self) -> ExecutionCursor {
        *self.cursor.borrow()
    }

    pub fn watch_cursor(&self) -> watch::Receiver<ExecutionCursor> {
        self.cursor.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(mut self) -> Result<RunReport, SafetyError> {
        wait_report(&mut self.report).await
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<RunReport, SafetyError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| {
                SafetyError::Timeout(format!("run did not finish within {} ms", timeout.as_millis()))
            })?
    }
}

async fn wait_report(
    report: &mut watch::Receiver<Option<RunReport>>,
) -> Result<RunReport, SafetyError> {
    let done = report
        .wait_for(Option::is_some)
        .await
        .map_err(|_| SafetyError::Channel("run task ended without a report".into()))?;
    let report: Option<RunReport> = (*done).clone();
    report.ok_or_else(|| SafetyError::Channel("run task ended without a report".into()))
}

type Reply = oneshot::Sender<Result<ExecutionCursor, SafetyError>>;

enum Control {
    Pause(Reply),
    Resume(Reply),
}

impl Control {
    fn verb(&self) -> &'static str {
        match self {
            Control::Pause(_) => "pause",
            Control::Resume(_) => "resume",
        }
    }
}

struct ActiveRun {
    protocol_id: String,
    control: mpsc::Sender<Control>,
    cursor: watch::Receiver<ExecutionCursor>,
    report: watch::Receiver<Option<RunReport>>,
    token: CancellationToken,
}

impl ActiveRun {
    fn finished(&self) -> bool {
        self.report.borrow().is_some()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ProtocolExecutionEngine
// ────────────────────────────────────────────────────────────────────────────

/// Starts runs and routes operator control to the active one.
///
/// At most one run is active at a time.
pub struct ProtocolExecutionEngine {
    config: EngineConfig,
    safety: SafetyHandle,
    verdicts: watch::Receiver<VerdictSnapshot>,
    hardware: HardwareSet,
    bus: EventBus,
    token: CancellationToken,
    active: Mutex<Option<ActiveRun>>,
}

impl ProtocolExecutionEngine {
    /// Runs are cancelled with `token` in addition to [`stop`](Self::stop).
    pub fn new(
        config: EngineConfig,
        safety: SafetyHandle,
        verdicts: watch::Receiver<VerdictSnapshot>,
        hardware: HardwareSet,
        bus: EventBus,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            safety,
            verdicts,
            hardware,
            bus,
            token,
            active: Mutex::new(None),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ask the state machine for TREATING and start running `protocol`.
    ///
    /// The state machine re-checks every line against the limits first, so
    /// a violation comes back as [`SafetyError::LimitViolation`] with no
    /// hardware call issued.
    pub async fn start(&self, protocol: Protocol) -> Result<RunHandle, SafetyError> {
        if let Some(run) = self.lock_active().as_ref() {
            if !run.finished() {
                return Err(SafetyError::state_conflict(
                    self.safety.current_state(),
                    format!("start '{}' while '{}' is running", protocol.id, run.protocol_id),
                ));
            }
        }

        self.safety.request_start(&protocol).await?;

        let (cursor_tx, cursor_rx) = watch::channel(ExecutionCursor {
            status: ExecutionStatus::Running,
            ..ExecutionCursor::default()
        });
        let (report_tx, report_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel(4);
        let token = self.token.child_token();
        let protocol_id = protocol.id.clone();

        let run = Run {
            verifier: LimitVerifier::from_limits(&protocol.safety_limits),
            protocol: Arc::new(protocol),
            config: self.config.clone(),
            safety: self.safety.clone(),
            gate: self.safety.energy_gate(),
            verdicts: self.verdicts.clone(),
            hardware: self.hardware.clone(),
            bus: self.bus.clone(),
            token: token.clone(),
            cursor: cursor_tx,
            control: control_rx,
            pending_pause: None,
            lines_executed: 0,
        };

        *self.lock_active() = Some(ActiveRun {
            protocol_id: protocol_id.clone(),
            control: control_tx,
            cursor: cursor_rx.clone(),
            report: report_rx.clone(),
            token,
        });
        tokio::spawn(async move {
            let report = run.execute().await;
            report_tx.send_replace(Some(report));
        });

        Ok(RunHandle {
            protocol_id,
            cursor: cursor_rx,
            report: report_rx,
        })
    }

    /// Suspend the active run at its next dwell point.
    ///
    /// Fails with [`SafetyError::Timeout`] when the run does not reach one
    /// within `control_timeout`; the request is then withdrawn.
    pub async fn pause(&self) -> Result<ExecutionCursor, SafetyError> {
        self.control(Control::Pause).await
    }

    /// Continue a paused run with its remaining dwell.
    pub async fn resume(&self) -> Result<ExecutionCursor, SafetyError> {
        self.control(Control::Resume).await
    }

    async fn control(&self, make: fn(Reply) -> Control) -> Result<ExecutionCursor, SafetyError> {
        let (reply, response) = oneshot::channel();
        let control = make(reply);
        let verb = control.verb();

        let sender = match self.lock_active().as_ref() {
            Some(run) if !run.finished() => run.control.clone(),
            _ => {
                return Err(SafetyError::state_conflict(
                    self.safety.current_state(),
                    format!("{verb} with no protocol running"),
                ));
            }
        };
        sender
            .send(control)
            .await
            .map_err(|_| SafetyError::Channel("run already finished".into()))?;

        match tokio::time::timeout(self.config.control_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SafetyError::Channel(format!(
                "run finished before acknowledging {verb}"
            ))),
            Err(_) => Err(SafetyError::Timeout(format!(
                "{verb} not acknowledged within {} ms",
                self.config.control_timeout.as_millis()
            ))),
        }
    }

    /// Cancel the active run, wait for it to wind down, then return the
    /// machine to ARMED. Without an active run only the state request is
    /// made, which is a no-op outside TREATING.
    pub async fn stop(&self) -> Result<Option<RunReport>, SafetyError> {
        let active = self
            .lock_active()
            .as_ref()
            .map(|run| (run.token.clone(), run.report.clone()));

        let report = match active {
            Some((token, mut report)) => {
                token.cancel();
                let budget = self.config.cancel_budget * 2;
                let report = tokio::time::timeout(budget, wait_report(&mut report))
                    .await
                    .map_err(|_| {
                        SafetyError::Timeout(format!(
                            "run did not wind down within {} ms",
                            budget.as_millis()
                        ))
                    })??;
                Some(report)
            }
            None => None,
        };
        self.safety.request_stop().await?;
        Ok(report)
    }

    /// Cursor of the active or most recent run.
    pub fn cursor(&self) -> Option<ExecutionCursor> {
        self.lock_active().as_ref().map(|run| *run.cursor.borrow())
    }

    pub fn is_running(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|run| !run.finished())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Run task
// ────────────────────────────────────────────────────────────────────────────

struct Run {
    protocol: Arc<Protocol>,
    config: EngineConfig,
    safety: SafetyHandle,
    gate: Arc<EnergyGate>,
    verdicts: watch::Receiver<VerdictSnapshot>,
    hardware: HardwareSet,
    bus: EventBus,
    token: CancellationToken,
    verifier: LimitVerifier,
    cursor: watch::Sender<ExecutionCursor>,
    control: mpsc::Receiver<Control>,
    /// Pause requested while no dwell was running.
    pending_pause: Option<Reply>,
    lines_executed: usize,
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Run {
    async fn execute(mut self) -> RunReport {
        info!(
            protocol = %self.protocol.id,
            loops = self.protocol.loop_count,
            lines = self.protocol.lines.len(),
            "protocol run started"
        );

        let (status, error) = match self.run_all().await {
            Ok(()) => match self.safety.report_protocol_complete().await {
                Ok(outcome) => {
                    if outcome.current.is_fault() {
                        warn!(state = %outcome.current, "treatment ended in a fault after the last line");
                    }
                    (ExecutionStatus::Completed, None)
                }
                Err(e) => {
                    warn!(error = %e, "run finished but treatment had already ended");
                    (ExecutionStatus::Aborted, Some(e))
                }
            },
            Err(e) => {
                self.escalate(&e).await;
                let error = match self.wind_down().await {
                    Ok(()) => e,
                    Err(wind_down) => {
                        warn!(cause = %e, error = %wind_down, "wind-down failed after run error");
                        wind_down
                    }
                };
                (ExecutionStatus::Aborted, Some(error))
            }
        };

        let cursor = ExecutionCursor {
            status,
            remaining_dwell_ms: None,
            ..*self.cursor.borrow()
        };
        self.publish_cursor(cursor);

        match &error {
            None => info!(
                protocol = %self.protocol.id,
                lines_executed = self.lines_executed,
                "protocol run completed"
            ),
            Some(e) => warn!(
                protocol = %self.protocol.id,
                lines_executed = self.lines_executed,
                line = cursor.current_line_index,
                loop_iteration = cursor.loop_iteration,
                error = %e,
                "protocol run aborted"
            ),
        }

        RunReport {
            protocol_id: self.protocol.id.clone(),
            status,
            cursor,
            lines_executed: self.lines_executed,
            error,
        }
    }

    async fn run_all(&mut self) -> Result<(), SafetyError> {
        let protocol = Arc::clone(&self.protocol);
        for iteration in 0..protocol.loop_count {
            for (index, line) in protocol.lines.iter().enumerate() {
                self.line_boundary(index, iteration, line).await?;
                self.run_line(index, iteration, line).await?;
                self.lines_executed += 1;
            }
        }
        Ok(())
    }

    fn publish_cursor(&self, cursor: ExecutionCursor) {
        self.cursor.send_replace(cursor);
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::ProtocolProgress(ProgressUpdate {
                protocol_id: self.protocol.id.clone(),
                line_index: cursor.current_line_index,
                loop_iteration: cursor.loop_iteration,
                status: cursor.status,
            }),
        ));
    }

    fn require_treating(&self) -> Result<(), SafetyError> {
        let state = self.gate.state();
        if state == SafetyState::Treating {
            Ok(())
        } else {
            Err(SafetyError::SafetyViolation { state })
        }
    }

    fn check_safety(&self) -> Result<(), SafetyError> {
        self.require_treating()?;
        let verdict = self.verdicts.borrow();
        if verdict.permits(self.config.verdict_max_age) {
            Ok(())
        } else {
            Err(SafetyError::InterlockViolation {
                failed: verdict.failed(),
            })
        }
    }

    fn aborted(&self) -> SafetyError {
        SafetyError::OperatorAbort(format!("run of '{}' stopped", self.protocol.id))
    }

    /// Publish the new line and honour any pause that arrived outside a
    /// dwell.
    async fn line_boundary(
        &mut self,
        index: usize,
        iteration: u32,
        line: &ProtocolAction,
    ) -> Result<(), SafetyError> {
        self.publish_cursor(ExecutionCursor {
            current_line_index: index,
            loop_iteration: iteration,
            status: ExecutionStatus::Running,
            remaining_dwell_ms: None,
        });
        while let Ok(control) = self.control.try_recv() {
            self.defer(control);
        }
        if let Some(reply) = self.pending_pause.take() {
            if reply.is_closed() {
                debug!(line = index, "pause withdrawn by its caller before the line boundary");
            } else {
                self.hold_paused(index, iteration, line, None, reply).await?;
            }
        }
        Ok(())
    }

    /// Handle a control message that arrived where pausing is not allowed.
    fn defer(&mut self, control: Control) {
        match control {
            Control::Pause(reply) => {
                if let Some(previous) = self.pending_pause.replace(reply) {
                    let _ = previous.send(Err(SafetyError::Channel(
                        "superseded by a newer pause".into(),
                    )));
                }
            }
            Control::Resume(reply) => {
                let _ = reply.send(Err(SafetyError::state_conflict(
                    self.gate.state(),
                    "resume a run that is not paused",
                )));
            }
        }
    }

    async fn run_line(
        &mut self,
        index: usize,
        iteration: u32,
        line: &ProtocolAction,
    ) -> Result<(), SafetyError> {
        self.require_treating()?;
        self.verifier.verify_line(index, line)?;

        let power = line.energy.as_ref().map_or(0.0, EnergySpec::initial_power);
        self.hardware.energy.set_power(power, &self.token).await?;

        let mut travel = None;
        if let Some(movement) = &line.movement {
            self.require_treating()?;
            let from = self.hardware.positioner.last_status().position;
            self.hardware
                .positioner
                .move_to(movement.target_position, movement.speed, &self.token)
                .await?;
            let estimate = (movement.target_position - from).abs() / movement.speed;
            travel = Some(
                Duration::try_from_secs_f64(estimate).unwrap_or(self.config.movement_timeout),
            );
        }
        debug!(line = index, loop_iteration = iteration, power, "line started");

        match (line.dwell(), &line.movement) {
            (Some(dwell), movement) => {
                self.dwell(index, iteration, line, dwell, power).await?;
                if movement.is_some() && self.hardware.positioner.last_status().in_motion {
                    debug!(line = index, "dwell ended before the move; halting positioner");
                    self.hardware.positioner.halt(&self.token).await?;
                }
                Ok(())
            }
            (None, Some(movement)) => {
                self.settle(line, movement.target_position, travel, power)
                    .await
            }
            (None, None) => Ok(()),
        }
    }

    /// Re-evaluate a ramp at `fraction` of its span.
    async fn ramp(
        &self,
        line: &ProtocolAction,
        fraction: f64,
        last: &mut f64,
    ) -> Result<(), SafetyError> {
        if let Some(spec @ EnergySpec::Ramp { .. }) = &line.energy {
            let power = spec.power_at(fraction.clamp(0.0, 1.0));
            if (power - *last).abs() >= RAMP_STEP {
                self.hardware.energy.set_power(power, &self.token).await?;
                *last = power;
            }
        }
        Ok(())
    }

    async fn dwell(
        &mut self,
        index: usize,
        iteration: u32,
        line: &ProtocolAction,
        total: Duration,
        mut power: f64,
    ) -> Result<(), SafetyError> {
        let token = self.token.clone();
        let mut remaining = total;
        let mut segment_start = Instant::now();
        let mut poll = ticker(self.config.poll_interval);

        loop {
            let left = remaining.saturating_sub(segment_start.elapsed());
            if left.is_zero() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.aborted()),
                Some(control) = self.control.recv() => match control {
                    Control::Pause(reply) => {
                        remaining = remaining.saturating_sub(segment_start.elapsed());
                        self.hold_paused(index, iteration, line, Some(remaining), reply).await?;
                        let fraction = 1.0 - remaining.as_secs_f64() / total.as_secs_f64();
                        power = 0.0;
                        self.restore(line, fraction, &mut power).await?;
                        segment_start = Instant::now();
                    }
                    other => self.defer(other),
                },
                _ = tokio::time::sleep(left) => return Ok(()),
                _ = poll.tick() => {
                    self.check_safety()?;
                    let done = total.saturating_sub(left);
                    let fraction = done.as_secs_f64() / total.as_secs_f64();
                    self.ramp(line, fraction, &mut power).await?;
                }
            }
        }
    }

    /// Put the line's power back after a pause.
    async fn restore(
        &self,
        line: &ProtocolAction,
        fraction: f64,
        last: &mut f64,
    ) -> Result<(), SafetyError> {
        match &line.energy {
            Some(EnergySpec::Fixed { power }) => {
                self.hardware.energy.set_power(*power, &self.token).await?;
                *last = *power;
                Ok(())
            }
            Some(EnergySpec::Ramp { .. }) => self.ramp(line, fraction, last).await,
            None => Ok(()),
        }
    }

    /// Wait for the positioner to reach `target` and stop moving.
    async fn settle(
        &mut self,
        line: &ProtocolAction,
        target: f64,
        travel: Option<Duration>,
        mut power: f64,
    ) -> Result<(), SafetyError> {
        let token = self.token.clone();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.movement_timeout;
        let mut poll = ticker(self.config.poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.aborted()),
                Some(control) = self.control.recv() => self.defer(control),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SafetyError::hardware(
                        self.hardware.positioner.id(),
                        format!(
                            "did not settle at {target} within {} ms",
                            self.config.movement_timeout.as_millis()
                        ),
                    ));
                }
                _ = poll.tick() => {
                    self.check_safety()?;
                    let status = self.hardware.positioner.last_status();
                    if let Some(fault) = status.fault {
                        return Err(SafetyError::hardware(self.hardware.positioner.id(), fault));
                    }
                    if !status.in_motion && (status.position - target).abs() <= SETTLE_TOLERANCE {
                        return Ok(());
                    }
                    if let Some(span) = travel.filter(|t| !t.is_zero()) {
                        let fraction = started.elapsed().as_secs_f64() / span.as_secs_f64();
                        self.ramp(line, fraction, &mut power).await?;
                    }
                }
            }
        }
    }

    /// Zero the output, acknowledge the pause and wait for resume.
    async fn hold_paused(
        &mut self,
        index: usize,
        iteration: u32,
        line: &ProtocolAction,
        remaining: Option<Duration>,
        reply: Reply,
    ) -> Result<(), SafetyError> {
        if let Err(e) = self.hardware.energy.set_power(0.0, &self.token).await {
            let _ = reply.send(Err(e.clone()));
            return Err(e);
        }
        let paused = ExecutionCursor {
            current_line_index: index,
            loop_iteration: iteration,
            status: ExecutionStatus::Paused,
            remaining_dwell_ms: remaining.map(millis),
        };
        self.publish_cursor(paused);
        info!(line = index, loop_iteration = iteration, remaining_dwell_ms = paused.remaining_dwell_ms, "protocol run paused");
        let _ = reply.send(Ok(paused));

        let token = self.token.clone();
        let mut poll = ticker(self.config.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.aborted()),
                control = self.control.recv() => match control {
                    Some(Control::Resume(reply)) => {
                        let revalidated = self
                            .check_safety()
                            .and_then(|()| self.verifier.verify_line(index, line));
                        if let Err(e) = revalidated {
                            let _ = reply.send(Err(e.clone()));
                            return Err(e);
                        }
                        let running = ExecutionCursor {
                            status: ExecutionStatus::Running,
                            ..paused
                        };
                        self.publish_cursor(running);
                        info!(line = index, "protocol run resumed");
                        let _ = reply.send(Ok(running));
                        return Ok(());
                    }
                    Some(Control::Pause(reply)) => {
                        let _ = reply.send(Ok(paused));
                    }
                    None => return Err(self.aborted()),
                },
                _ = poll.tick() => self.check_safety()?,
            }
        }
    }

    /// Route the reason a run ended into the state machine.
    async fn escalate(&self, error: &SafetyError) {
        let result = if error.routes_to_unsafe() {
            match error {
                SafetyError::InterlockViolation { failed } => {
                    self.safety
                        .report_interlock_verdict(false, failed.clone())
                        .await
                }
                SafetyError::WatchdogTimeout { .. } => self.safety.report_watchdog_missed().await,
                SafetyError::HardwareFault {
                    capability,
                    details,
                } => {
                    self.safety
                        .report_hardware_fault(capability.clone(), details.clone())
                        .await
                }
                other => self.safety.report_hardware_fault(SOURCE, other.to_string()).await,
            }
        } else {
            match error {
                // Already outside TREATING, or the operator's stop handles it.
                SafetyError::SafetyViolation { .. }
                | SafetyError::StateConflict { .. }
                | SafetyError::OperatorAbort(_) => return,
                other => self.safety.report_run_aborted(other.to_string()).await,
            }
        };
        if let Err(e) = result {
            error!(error = %e, cause = %error, "could not escalate run failure");
        }
    }

    /// Zero the output and halt the positioner, bounded by the cancellation
    /// budget. An output left live or an overrun budget is escalated and
    /// returned.
    async fn wind_down(&self) -> Result<(), SafetyError> {
        let token = CancellationToken::new();
        let energy = &self.hardware.energy;
        let positioner = &self.hardware.positioner;
        let zero = async {
            match energy.set_power(0.0, &token).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "could not zero power while winding down; disabling");
                    energy.disable(&token).await
                }
            }
        };
        let both = async {
            let (power, halt) = tokio::join!(zero, positioner.halt(&token));
            if let Err(e) = halt {
                warn!(error = %e, "could not halt positioner while winding down");
            }
            power
        };

        let failure = match tokio::time::timeout(self.config.cancel_budget, both).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => SafetyError::hardware(
                energy.id(),
                format!("output not stopped after the run: {e}"),
            ),
            Err(_) => SafetyError::Timeout(format!(
                "wind-down exceeded the {} ms cancellation budget",
                millis(self.config.cancel_budget)
            )),
        };
        error!(error = %failure, "run wind-down failed");
        self.escalate(&failure).await;
        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulseguard_hal::sim::{CallKind, ENERGY_ID, POSITIONER_ID, SimRig};
    use pulseguard_kernel::{SafetyMachineConfig, SafetyStateMachine, SelectiveShutdownCoordinator};
    use pulseguard_middleware::Topic;
    use pulseguard_types::{RampCurve, SafetyLimits};
    use std::collections::BTreeMap;

    fn verdict(ok: bool) -> VerdictSnapshot {
        VerdictSnapshot {
            overall_satisfied: ok,
            per_interlock: BTreeMap::from([("deadman".to_string(), ok)]),
            sequence: 1,
            timestamp: Utc::now(),
        }
    }

    fn limits() -> SafetyLimits {
        SafetyLimits {
            max_power: 10.0,
            min_position: 0.0,
            max_position: 100.0,
        }
    }

    struct Bench {
        rig: SimRig,
        bus: EventBus,
        safety: SafetyHandle,
        engine: ProtocolExecutionEngine,
        verdict_tx: watch::Sender<VerdictSnapshot>,
    }

    async fn bench() -> Bench {
        bench_with(|_| {}).await
    }

    async fn bench_with(tune: impl FnOnce(&mut EngineConfig)) -> Bench {
        let rig = SimRig::new(Duration::from_millis(100), Duration::from_secs(1));
        let bus = EventBus::default();
        let (verdict_tx, verdicts) = watch::channel(verdict(true));
        let mut machine = SafetyStateMachine::new(
            SafetyMachineConfig {
                verdict_max_age: Duration::from_secs(60),
                ..SafetyMachineConfig::default()
            },
            verdicts.clone(),
            bus.clone(),
        );
        let mut hardware = rig.hardware.clone();
        hardware.energy = hardware.energy.with_permit(machine.energy_gate());
        machine.add_observer(Arc::new(SelectiveShutdownCoordinator::new(
            hardware.energy.clone(),
            bus.clone(),
        )));
        let (safety, _task) = machine.spawn(CancellationToken::new());
        safety.request_arm().await.unwrap();

        let mut config = EngineConfig {
            poll_interval: Duration::from_millis(10),
            movement_timeout: Duration::from_secs(2),
            verdict_max_age: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        tune(&mut config);
        let engine = ProtocolExecutionEngine::new(
            config,
            safety.clone(),
            verdicts,
            hardware,
            bus.clone(),
            CancellationToken::new(),
        );
        Bench {
            rig,
            bus,
            safety,
            engine,
            verdict_tx,
        }
    }

    #[tokio::test]
    async fn single_line_completes_and_returns_to_armed() {
        let b = bench().await;
        let protocol = Protocol::new("p1", "one line", limits())
            .with_line(ProtocolAction::new().with_fixed_power(5.0).with_dwell_ms(30));

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.lines_executed, 1);
        assert_eq!(b.safety.current_state(), SafetyState::Armed);

        let energy = b.rig.log.for_capability(ENERGY_ID);
        assert_eq!(energy.first(), Some(&CallKind::SetPower(5.0)));
        assert_eq!(energy.last(), Some(&CallKind::SetPower(0.0)));
    }

    #[tokio::test]
    async fn zero_loops_complete_without_hardware_calls() {
        let b = bench().await;
        let protocol = Protocol::new("p0", "no loops", limits())
            .with_line(ProtocolAction::new().with_fixed_power(5.0).with_dwell_ms(30))
            .with_loop_count(0);

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.lines_executed, 0);
        assert!(b.rig.log.nonzero_power_writes().is_empty());
        assert!(b.rig.log.for_capability(POSITIONER_ID).is_empty());
    }

    #[tokio::test]
    async fn over_limit_line_is_rejected_before_hardware() {
        let b = bench().await;
        let protocol = Protocol::new("hot", "hot", limits())
            .with_line(ProtocolAction::new().with_fixed_power(15.0).with_dwell_ms(30));

        let err = b.engine.start(protocol).await.err().unwrap();
        assert!(matches!(err, SafetyError::LimitViolation { line: 0, .. }));
        assert!(b.rig.log.is_empty());
        assert_eq!(b.safety.current_state(), SafetyState::Armed);
    }

    #[tokio::test]
    async fn ramp_rises_over_the_dwell() {
        let b = bench().await;
        let protocol = Protocol::new("ramp", "ramp", limits()).with_line(
            ProtocolAction::new()
                .with_energy(EnergySpec::Ramp {
                    start_power: 2.0,
                    end_power: 8.0,
                    curve: RampCurve::Linear,
                })
                .with_dwell_ms(100),
        );

        b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        let writes: Vec<f64> = b.rig.log.nonzero_power_writes().into_iter().map(|(_, p)| p).collect();
        assert!(writes.len() >= 3, "{writes:?}");
        assert_eq!(writes[0], 2.0);
        assert!(writes.windows(2).all(|w| w[1] >= w[0]), "{writes:?}");
        assert!(writes.iter().all(|p| *p <= 8.0));
    }

    #[tokio::test]
    async fn line_without_dwell_waits_for_the_move() {
        let b = bench().await;
        let protocol = Protocol::new("move", "move", limits())
            .with_line(ProtocolAction::new().with_movement(5.0, 100.0));

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        let status = b.rig.positioner.status();
        assert!(!status.in_motion);
        assert!((status.position - 5.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn pause_keeps_remaining_dwell() {
        let b = bench().await;
        let protocol = Protocol::new("long", "long", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(200));
        let run = b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let paused = b.engine.pause().await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        let remaining = paused.remaining_dwell_ms.unwrap();
        assert!(remaining < 200 && remaining > 50, "{remaining}");
        assert_eq!(b.rig.energy.status().commanded_power, 0.0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let resumed_at = Instant::now();
        b.engine.resume().await.unwrap();
        let report = run.wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert!(resumed_at.elapsed() < Duration::from_millis(190));
        assert!(resumed_at.elapsed() >= Duration::from_millis(remaining.saturating_sub(20)));
    }

    #[tokio::test]
    async fn stop_aborts_and_returns_to_armed() {
        let b = bench().await;
        let protocol = Protocol::new("long", "long", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(5_000));
        b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = b.engine.stop().await.unwrap().unwrap();
        assert_eq!(report.status, ExecutionStatus::Aborted);
        assert!(matches!(report.error, Some(SafetyError::OperatorAbort(_))));
        assert_eq!(b.safety.current_state(), SafetyState::Armed);
        assert_eq!(b.rig.energy.status().commanded_power, 0.0);
        assert!(!b.engine.is_running());
    }

    #[tokio::test]
    async fn lost_verdict_aborts_and_disables_before_halt() {
        let b = bench().await;
        let mut faults = b.bus.subscribe_to(Topic::Faults);
        let protocol = Protocol::new("long", "long", limits()).with_line(
            ProtocolAction::new()
                .with_fixed_power(4.0)
                .with_movement(50.0, 10.0)
                .with_dwell_ms(5_000),
        );
        let run = b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        b.verdict_tx.send_replace(verdict(false));
        let report = run.wait().await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Aborted);
        assert!(matches!(report.error, Some(SafetyError::InterlockViolation { .. })));
        assert_eq!(b.safety.current_state(), SafetyState::Unsafe);
        assert!(faults.try_recv().is_ok());

        let disable = b
            .rig
            .log
            .position_from(0, |c| c.kind == CallKind::Disable)
            .unwrap();
        let halt = b.rig.log.position_from(0, |c| c.kind == CallKind::Halt).unwrap();
        assert!(disable < halt);
    }

    #[tokio::test]
    async fn energy_failure_is_a_hardware_fault() {
        let b = bench().await;
        b.rig.energy.fail_next(1);
        let protocol = Protocol::new("p", "p", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(30));

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert!(matches!(report.error, Some(SafetyError::HardwareFault { .. })));
        assert_eq!(b.safety.current_state(), SafetyState::Unsafe);
    }

    #[tokio::test]
    async fn stop_with_stuck_output_ends_unsafe() {
        let b = bench().await;
        let protocol = Protocol::new("long", "long", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(5_000));
        b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        b.rig.energy.fail_next(10);
        let report = b.engine.stop().await.unwrap().unwrap();

        assert_eq!(report.status, ExecutionStatus::Aborted);
        assert!(matches!(
            report.error,
            Some(SafetyError::HardwareFault { ref capability, .. }) if capability == ENERGY_ID
        ));
        assert_eq!(b.safety.current_state(), SafetyState::Unsafe);
        assert!(!b.safety.energy_gate().is_open());
    }

    #[tokio::test]
    async fn completion_with_stuck_output_ends_unsafe() {
        let b = bench().await;
        let protocol = Protocol::new("p", "p", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(60));
        let run = b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        b.rig.energy.fail_next(10);
        let report = run.wait().await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(b.safety.current_state(), SafetyState::Unsafe);
    }

    #[tokio::test]
    async fn wind_down_over_budget_is_a_timeout_and_unsafe() {
        let b = bench_with(|c| c.cancel_budget = Duration::from_millis(60)).await;
        let protocol = Protocol::new("long", "long", limits())
            .with_line(ProtocolAction::new().with_fixed_power(4.0).with_dwell_ms(5_000));
        let run = b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        b.rig.energy.set_latency(Duration::from_millis(150));
        // The stop itself gives up waiting; the run still reports.
        let _ = b.engine.stop().await;
        let report = run.wait().await.unwrap();

        assert_eq!(report.status, ExecutionStatus::Aborted);
        assert!(matches!(report.error, Some(SafetyError::Timeout(_))), "{:?}", report.error);
        let state = b
            .safety
            .wait_for(Duration::from_secs(1), SafetyState::is_fault)
            .await
            .unwrap();
        assert_eq!(state, SafetyState::Unsafe);
    }

    #[tokio::test]
    async fn limit_errors_abort_to_armed() {
        let b = bench().await;
        let run = Run {
            verifier: LimitVerifier::from_limits(&limits()),
            protocol: Arc::new(Protocol::new("p", "p", limits())),
            config: EngineConfig::default(),
            safety: b.safety.clone(),
            gate: b.safety.energy_gate(),
            verdicts: watch::channel(verdict(true)).1,
            hardware: b.rig.hardware.clone(),
            bus: b.bus.clone(),
            token: CancellationToken::new(),
            cursor: watch::channel(ExecutionCursor::default()).0,
            control: mpsc::channel(1).1,
            pending_pause: None,
            lines_executed: 0,
        };
        b.safety.request_start(&run.protocol).await.unwrap();

        run.escalate(&SafetyError::LimitViolation {
            line: 0,
            details: "too hot".into(),
        })
        .await;
        assert_eq!(b.safety.current_state(), SafetyState::Armed);

        b.safety.request_start(&run.protocol).await.unwrap();
        run.escalate(&SafetyError::Timeout("slow".into())).await;
        assert_eq!(b.safety.current_state(), SafetyState::Unsafe);
    }

    #[tokio::test]
    async fn pause_that_times_out_never_takes_effect() {
        let b = bench_with(|c| c.control_timeout = Duration::from_millis(200)).await;
        let mut progress = b.bus.subscribe_to(Topic::ProtocolProgress);
        let protocol = Protocol::new("move", "move", limits())
            .with_line(ProtocolAction::new().with_movement(3.0, 2.5))
            .with_line(ProtocolAction::new().with_dwell_ms(100));
        let run = b.engine.start(protocol).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(b.engine.pause().await, Err(SafetyError::Timeout(_))));

        let report = run.wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.lines_executed, 2);
        assert!(progress.drain().iter().all(|e| !matches!(
            &e.payload,
            EventPayload::ProtocolProgress(p) if p.status == ExecutionStatus::Paused
        )));
    }

    #[tokio::test]
    async fn dwell_shorter_than_the_move_halts_the_positioner() {
        let b = bench().await;
        let protocol = Protocol::new("short", "short", limits())
            .with_line(ProtocolAction::new().with_movement(100.0, 10.0).with_dwell_ms(50));

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert!(b.rig.log.for_capability(POSITIONER_ID).contains(&CallKind::Halt));
        let status = b.rig.positioner.status();
        assert!(!status.in_motion);
        assert!(status.position < 100.0);
    }

    #[tokio::test]
    async fn second_start_is_a_state_conflict() {
        let b = bench().await;
        let protocol = Protocol::new("long", "long", limits())
            .with_line(ProtocolAction::new().with_dwell_ms(5_000));
        b.engine.start(protocol.clone()).await.unwrap();
        assert!(matches!(
            b.engine.start(protocol).await,
            Err(SafetyError::StateConflict { .. })
        ));
        b.engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_without_run_is_rejected() {
        let b = bench().await;
        assert!(matches!(
            b.engine.pause().await,
            Err(SafetyError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn progress_is_published_per_line() {
        let b = bench().await;
        let mut progress = b.bus.subscribe_to(Topic::ProtocolProgress);
        let protocol = Protocol::new("two", "two", limits())
            .with_line(ProtocolAction::new().with_dwell_ms(10))
            .with_line(ProtocolAction::new().with_dwell_ms(10))
            .with_loop_count(2);

        let report = b.engine.start(protocol).await.unwrap().wait().await.unwrap();
        assert_eq!(report.lines_executed, 4);
        let events = progress.drain();
        let running = events
            .iter()
            .filter(|e| matches!(&e.payload, EventPayload::ProtocolProgress(p) if p.status == ExecutionStatus::Running))
            .count();
        assert_eq!(running, 4);
        assert!(matches!(
            &events.last().unwrap().payload,
            EventPayload::ProtocolProgress(p) if p.status == ExecutionStatus::Completed
        ));
    }
}
