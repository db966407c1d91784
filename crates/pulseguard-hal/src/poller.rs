//! Per-capability status polling.
//!
//! One background task per capability queries the device at a fixed period.
//! Sensing is non-critical: a failed poll is logged and the loop carries on.
//! Safety-relevant connection loss reaches the interlock aggregator through
//! the capability's status channel, not through this task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::handle::CapabilityHandle;

/// Poll `handle` every `period` until `token` is cancelled.
pub fn spawn_status_poller<T>(
    handle: CapabilityHandle<T>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    T: Capability + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match handle.status(&token).await {
                Ok(snapshot) => {
                    if failures > 0 {
                        debug!(capability = handle.id(), failures, "status poll recovered");
                    }
                    failures = 0;
                    if let Some(fault) = &snapshot.fault {
                        warn!(capability = handle.id(), fault = %fault, "device reports fault");
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(capability = handle.id(), failures, error = %e, "status poll failed");
                }
            }
        }
        debug!(capability = handle.id(), "status poller stopped");
    })
}
