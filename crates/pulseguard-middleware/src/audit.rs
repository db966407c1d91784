//! Audit forwarding.
//!
//! The audit store itself lives outside the controller. This module owns the
//! seam ([`AuditSink`]) and the task that copies every bus event into it.
//! Delivery is at-least-attempted: each event gets a bounded number of tries
//! and is then dropped with a log line. A failing sink never blocks the bus
//! and never reaches back into the safety core.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulseguard_types::{Event, SafetyError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{EventBus, Topic, TopicReceiver};

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &Event) -> Result<(), SafetyError>;
}

// ────────────────────────────────────────────────────────────────────────────
// AuditForwarder
// ────────────────────────────────────────────────────────────────────────────

/// Subscribes to every bus lane and forwards events to an [`AuditSink`].
pub struct AuditForwarder {
    bus: EventBus,
    sink: Arc<dyn AuditSink>,
    max_attempts: u32,
    backoff: Duration,
}

impl AuditForwarder {
    pub fn new(bus: EventBus, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            bus,
            sink,
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }

    /// Override the retry policy. `max_attempts` is floored at 1.
    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Subscribe to all lanes now and forward until `token` is cancelled or
    /// the bus closes.
    ///
    /// Subscriptions are taken before the task is spawned so no event
    /// published after this call returns is missed.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        let [mut states, mut interlocks, mut progress, mut faults] =
            Topic::ALL.map(|topic| self.bus.subscribe_to(topic));
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    r = faults.recv() => (Topic::Faults, r),
                    r = states.recv() => (Topic::StateChanges, r),
                    r = progress.recv() => (Topic::ProtocolProgress, r),
                    r = interlocks.recv() => (Topic::InterlockStatus, r),
                };
                match received {
                    (_, Ok(event)) => self.forward(&event).await,
                    (topic, Err(RecvError::Lagged(n))) => {
                        warn!(?topic, skipped = n, "audit forwarder lagged; events lost");
                    }
                    (topic, Err(RecvError::Closed)) => {
                        debug!(?topic, "event bus closed; audit forwarder stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn forward(&self, event: &Event) {
        for attempt in 1..=self.max_attempts {
            match self.sink.record(event).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(event_id = %event.id, attempt, error = %e, "audit sink rejected event");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        error!(
            event_id = %event.id,
            source = %event.source,
            attempts = self.max_attempts,
            "dropping audit event after exhausting retries"
        );
    }
}

/// Next event on `rx`, skipping lag gaps. `None` once the bus is gone.
pub async fn next_event(rx: &mut TopicReceiver) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MemoryAuditSink
// ────────────────────────────────────────────────────────────────────────────

/// In-memory sink. Can be told to reject the next `n` records.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<Event>>,
    fail_next: AtomicU32,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` calls to [`AuditSink::record`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything recorded so far, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &Event) -> Result<(), SafetyError> {
        let rejected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SafetyError::Channel("audit store unavailable".into()));
        }
        match self.events.lock() {
            Ok(mut guard) => guard.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}
