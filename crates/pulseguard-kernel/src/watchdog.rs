//! [`WatchdogHeartbeatService`] – keeps the external hardware timer alive.
//!
//! The hardware timer removes energy-output permission on its own when it
//! stops receiving reset pulses. This service sends those pulses every
//! `interval` while the machine is ARMED or TREATING, and reports a missed
//! heartbeat to the [`SafetyHandle`] when it cannot keep up:
//!
//! - more than one consecutive send failure, or
//! - no successful send for longer than `timeout`.
//!
//! The report is made once per episode. An episode ends on the next
//! successful send or when the machine leaves the heartbeat states.
//!
//! [`WatchdogHeartbeatService::spawn_dedicated`] runs the loop on its own OS
//! thread with a private runtime so protocol execution and operator I/O
//! cannot delay it.

use std::time::{Duration, Instant};

use pulseguard_hal::WatchdogHandle;
use pulseguard_types::SafetyError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::safety_machine::SafetyHandle;

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Period between reset pulses.
    pub interval: Duration,
    /// Hardware timer trip time.
    pub timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_millis(1000),
        }
    }
}

impl WatchdogConfig {
    /// The interval must be non-zero and at most half the timeout.
    pub fn validate(&self) -> Result<(), SafetyError> {
        if self.interval.is_zero() {
            return Err(SafetyError::Configuration(
                "watchdog interval must be non-zero".into(),
            ));
        }
        if self.interval * 2 > self.timeout {
            return Err(SafetyError::Configuration(format!(
                "watchdog interval {} ms exceeds half the timeout {} ms",
                self.interval.as_millis(),
                self.timeout.as_millis()
            )));
        }
        Ok(())
    }
}

/// Observable heartbeat state. Written only by the service task.
///
/// `missed` stays set until the next successful heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogState {
    pub last_heartbeat_sent: Option<Instant>,
    pub timeout: Duration,
    /// A missed heartbeat has been reported for the current episode.
    pub missed: bool,
    pub consecutive_failures: u32,
}

/// Background heartbeat sender.
pub struct WatchdogHeartbeatService {
    config: WatchdogConfig,
    watchdog: WatchdogHandle,
    safety: SafetyHandle,
    state_tx: watch::Sender<WatchdogState>,
}

impl WatchdogHeartbeatService {
    pub fn new(
        config: WatchdogConfig,
        watchdog: WatchdogHandle,
        safety: SafetyHandle,
    ) -> Result<Self, SafetyError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(WatchdogState {
            last_heartbeat_sent: None,
            timeout: config.timeout,
            missed: false,
            consecutive_failures: 0,
        });
        Ok(Self {
            config,
            watchdog,
            safety,
            state_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchdogState> {
        self.state_tx.subscribe()
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Run on a dedicated OS thread with its own current-thread runtime.
    pub fn spawn_dedicated(
        self,
        token: CancellationToken,
    ) -> Result<std::thread::JoinHandle<()>, SafetyError> {
        std::thread::Builder::new()
            .name("pulseguard-watchdog".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "could not build watchdog runtime");
                        return;
                    }
                };
                runtime.block_on(self.run(token));
            })
            .map_err(|e| SafetyError::Configuration(format!("could not start watchdog thread: {e}")))
    }

    async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "watchdog heartbeat service started"
        );

        // Start of the current episode, or the last successful send in it.
        let mut last_ok: Option<Instant> = None;
        let mut failures = 0u32;
        let mut reported = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let state = self.safety.current_state();
            if !state.heartbeat_required() {
                if last_ok.take().is_some() {
                    debug!(%state, "heartbeats suspended");
                    failures = 0;
                    reported = false;
                    self.state_tx.send_modify(|s| s.consecutive_failures = 0);
                }
                continue;
            }
            last_ok.get_or_insert_with(Instant::now);

            match self
                .watchdog
                .send_heartbeat(self.config.interval, &token)
                .await
            {
                Ok(()) => {
                    let now = Instant::now();
                    last_ok = Some(now);
                    if failures > 0 {
                        info!(after_failures = failures, "watchdog heartbeat recovered");
                    }
                    failures = 0;
                    reported = false;
                    self.state_tx.send_modify(|s| {
                        s.last_heartbeat_sent = Some(now);
                        s.missed = false;
                        s.consecutive_failures = 0;
                    });
                }
                Err(_) if token.is_cancelled() => break,
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, consecutive_failures = failures, "watchdog heartbeat failed");
                    self.state_tx
                        .send_modify(|s| s.consecutive_failures = failures);
                }
            }

            let overdue = last_ok.is_some_and(|t| t.elapsed() > self.config.timeout);
            if (failures > 1 || overdue) && !reported {
                reported = true;
                let missed = SafetyError::WatchdogTimeout { missed: failures };
                error!(error = %missed, overdue, "watchdog heartbeat missed");
                self.state_tx.send_modify(|s| s.missed = true);
                if let Err(e) = self.safety.report_watchdog_missed().await {
                    warn!(error = %e, "could not report missed heartbeat");
                }
            }
        }
        debug!("watchdog heartbeat service stopped");
    }
}
