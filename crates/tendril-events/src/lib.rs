//! In-process event bus for strand, page and dispatcher notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event envelope (RFC3339 time). `subject` is the strand or page id the
/// event is about, when there is one.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub payload: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: &str, subject: Option<&str>, payload: &T) -> Self {
        let time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let payload =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        Self {
            time,
            kind: kind.to_string(),
            subject: subject.map(str::to_string),
            payload,
        }
    }
}

/// A broadcast bus for JSON-serializable events. Publishing never blocks
/// and never fails; events are dropped when nobody listens.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, subject: Option<&str>, payload: &T) -> Envelope {
        let env = Envelope::new(kind, subject, payload);
        self.publish_envelope(env.clone());
        env
    }

    pub fn publish_envelope(&self, env: Envelope) {
        if self.tx.send(env).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
