/// Typed engine events routed through the event bus
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod bus;

pub use bus::{ChannelListener, ChannelMessage, EventBus, EventSubscriber};

/// The closed set of event categories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    CommandExecuted,
    ResultCaptured,
    CompletionResponse,
    SyncCompleted,
    Error,
    StatusUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::CommandExecuted,
        EventKind::ResultCaptured,
        EventKind::CompletionResponse,
        EventKind::SyncCompleted,
        EventKind::Error,
        EventKind::StatusUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CommandExecuted => "command-executed",
            EventKind::ResultCaptured => "result-captured",
            EventKind::CompletionResponse => "completion-response",
            EventKind::SyncCompleted => "sync-completed",
            EventKind::Error => "error",
            EventKind::StatusUpdate => "status-update",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, source: &str, target: &str, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            id: format!("event_{}", Uuid::new_v4().simple()),
            kind,
            timestamp: Utc::now(),
            source: source.to_string(),
            target: target.to_string(),
            payload,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Truncate to `max_chars`, appending `...` when anything was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    } else {
        text.to_string()
    }
}
