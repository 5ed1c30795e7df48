use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Event kinds published on the bus. Dot-paths, coarse to fine.
pub mod topics {
    /// A card was written or replaced; payload is the full card.
    pub const TOPIC_CARD_WRITTEN: &str = "cards.written";
    /// An inbound browser event was accepted; payload is the event.
    pub const TOPIC_UI_EVENT: &str = "ui.event";
    /// A blocking wait resolved; payload carries card_id and action.
    pub const TOPIC_WAIT_RESOLVED: &str = "waits.resolved";
    /// A pending request was enqueued for the calling process.
    pub const TOPIC_PENDING_CREATED: &str = "pending.created";
    /// A pending request was acknowledged and retired.
    pub const TOPIC_PENDING_ACKED: &str = "pending.acked";
    /// A run and all of its state were deleted.
    pub const TOPIC_RUN_DELETED: &str = "runs.deleted";
    /// The service is shutting down.
    pub const TOPIC_SERVICE_STOPPING: &str = "service.stopping";
}

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A broadcast bus for JSON-serializable events, with a bounded replay
/// buffer so late SSE subscribers can catch up.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    replay: Arc<Mutex<VecDeque<Envelope>>>,
    replay_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 0)
    }

    pub fn new_with_replay(capacity: usize, replay_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_cap))),
            replay_cap,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        if self.replay_cap > 0 {
            if let Ok(mut buf) = self.replay.lock() {
                if buf.len() == self.replay_cap {
                    buf.pop_front();
                }
                buf.push_back(env.clone());
            }
        }
        if self.tx.send(env).is_err() {
            tracing::trace!(kind, "no live subscribers for event");
        }
    }

    /// Most recent buffered envelopes, oldest first, capped at `n`.
    pub fn replay(&self, n: usize) -> Vec<Envelope> {
        let buf = match self.replay.lock() {
            Ok(buf) => buf,
            Err(_) => return Vec::new(),
        };
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }
}
