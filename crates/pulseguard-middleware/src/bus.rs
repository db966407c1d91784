//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Each lane is bounded; a slow subscriber observes a `Lagged`
//! error instead of back-pressuring the safety core.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::StateChanges`] | `{previous, new, cause, timestamp}` per state machine transition |
//! | [`Topic::InterlockStatus`] | Per-interlock verdicts at the aggregator's sampling period |
//! | [`Topic::ProtocolProgress`] | `{line, loop, status}` per executed protocol line |
//! | [`Topic::Faults`] | Fault details from the selective shutdown coordinator |

use pulseguard_types::{Event, EventPayload};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    StateChanges,
    InterlockStatus,
    ProtocolProgress,
    Faults,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::StateChanges,
        Topic::InterlockStatus,
        Topic::ProtocolProgress,
        Topic::Faults,
    ];

    /// The lane a payload belongs to.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::StateChanged(_) => Topic::StateChanges,
            EventPayload::InterlockStatus(_) => Topic::InterlockStatus,
            EventPayload::ProtocolProgress(_) => Topic::ProtocolProgress,
            EventPayload::Fault(_) => Topic::Faults,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    state_changes: broadcast::Sender<Event>,
    interlock_status: broadcast::Sender<Event>,
    protocol_progress: broadcast::Sender<Event>,
    faults: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (state_changes, _) = broadcast::channel(capacity);
        let (interlock_status, _) = broadcast::channel(capacity);
        let (protocol_progress, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        Self {
            state_changes,
            interlock_status,
            protocol_progress,
            faults,
        }
    }

    /// Publish `event` on the lane matching its payload.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Returns `0` when nobody is listening, which is a normal condition for
    /// a headless controller.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Publish `event` to an explicit [`Topic`] lane.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.topic_sender(topic).send(event).unwrap_or(0)
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::StateChanges => &self.state_changes,
            Topic::InterlockStatus => &self.interlock_status,
            Topic::ProtocolProgress => &self.protocol_progress,
            Topic::Faults => &self.faults,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking poll for consumers that drain between ticks.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every event currently buffered, skipping over lag gaps.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
