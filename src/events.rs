//! Event model and in-process pub/sub.
//!
//! Every state change in the engine is published as an [`Event`]: a
//! millisecond timestamp plus a tagged [`EventKind`] payload. The
//! [`EventBroker`] fans events out to any number of subscribers, each of
//! which owns an independent bounded queue.
//!
//! Delivery is lossy by design. `publish` never blocks; when a subscriber's
//! queue is full the event is dropped for that subscriber only, so a stalled
//! consumer cannot slow the scheduler or starve its peers. Within one
//! subscriber the order is FIFO. Across subscribers only the timestamp
//! gives a total order.
//!
//! Each subscriber receives a synthetic `hello` event as its first message,
//! which lets stream consumers confirm the attach before real traffic.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::settings::Settings;

/// Milliseconds since the Unix epoch. The engine's single clock.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A timestamped engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub(crate) fn new(kind: EventKind) -> Self {
        Self {
            ts: now_ms(),
            kind,
        }
    }

    /// The event as a JSON object with a `type` tag, ready for a wire
    /// protocol that speaks JSON lines.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"hello\"}".to_string())
    }
}

/// Everything the engine announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event on every freshly attached subscriber.
    Hello,
    ChunkCreated {
        chunk_id: Uuid,
        total_hosts: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
    },
    ChunkStarted {
        chunk_id: Uuid,
    },
    ChunkProgress {
        chunk_id: Uuid,
        completed_hosts: usize,
        total_hosts: usize,
    },
    ChunkCompleted {
        chunk_id: Uuid,
        duration_ms: u64,
    },
    ChunkFailed {
        chunk_id: Uuid,
        error: String,
    },
    ChunkKilled {
        chunk_id: Uuid,
        reason: String,
    },
    ChunkSplit {
        chunk_id: Uuid,
        children: Vec<Uuid>,
    },
    ChunkRequeued {
        chunk_id: Uuid,
        attempt: u32,
    },
    HostCompleted {
        chunk_id: Uuid,
        address: String,
        ok: bool,
        duration_ms: u64,
    },
    SettingsUpdated {
        settings: Settings,
    },
}

impl EventKind {
    /// The chunk this event concerns, when there is one.
    pub fn chunk_id(&self) -> Option<Uuid> {
        match self {
            EventKind::ChunkCreated { chunk_id, .. }
            | EventKind::ChunkStarted { chunk_id }
            | EventKind::ChunkProgress { chunk_id, .. }
            | EventKind::ChunkCompleted { chunk_id, .. }
            | EventKind::ChunkFailed { chunk_id, .. }
            | EventKind::ChunkKilled { chunk_id, .. }
            | EventKind::ChunkSplit { chunk_id, .. }
            | EventKind::ChunkRequeued { chunk_id, .. }
            | EventKind::HostCompleted { chunk_id, .. } => Some(*chunk_id),
            EventKind::Hello | EventKind::SettingsUpdated { .. } => None,
        }
    }
}

/// Queue slots per subscriber unless overridden.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1000;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    dropped: u64,
}

/// Single-producer, many-subscriber event fanout.
pub struct EventBroker {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attaches a new subscriber. Its queue already holds the `hello`
    /// event when this returns.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        tx.try_send(Event::new(EventKind::Hello)).ok();
        self.subscribers.lock().push(Subscriber { tx, dropped: 0 });
        EventStream { rx }
    }

    /// Enqueues the event on every live subscriber without blocking.
    /// Full queues drop the event for that subscriber; closed subscribers
    /// are detached.
    pub fn publish(&self, kind: EventKind) {
        let event = Event::new(kind);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped += 1;
                tracing::warn!(
                    dropped = sub.dropped,
                    "subscriber queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving half handed to a subscriber.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Next event in FIFO order, or `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Adapts the handle into a `Stream` for `StreamExt` consumers.
    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}
