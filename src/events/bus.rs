//! Channel-based messaging and typed publish/subscribe.
//!
//! Two independent mechanisms share this owner object:
//! - named channels with a subscriber-id set and a bounded message history,
//!   where delivery goes to whichever [`ChannelListener`] is registered for
//!   each subscriber id;
//! - typed subscribers keyed by [`EventKind`], invoked on [`EventBus::publish`].
//!
//! Delivery in both is best-effort: a failing listener or subscriber is
//! logged and skipped, and the remaining ones still run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{Event, EventKind};
use crate::history::BoundedHistory;

/// Receives events of the kinds it was registered for.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Receives channel messages addressed to a subscriber id.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: Value,
}

struct Channel {
    kind: String,
    created_at: DateTime<Utc>,
    subscribers: RwLock<BTreeSet<String>>,
    history: BoundedHistory<ChannelMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub subscribers: Vec<String>,
    pub history_len: usize,
}

/// Outcome of a single fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

pub struct EventBus {
    channels: DashMap<String, Arc<Channel>>,
    listeners: DashMap<String, Arc<dyn ChannelListener>>,
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventSubscriber>>>>,
    channel_history_limit: usize,
}

impl EventBus {
    pub fn new(channel_history_limit: usize) -> Self {
        Self {
            channels: DashMap::new(),
            listeners: DashMap::new(),
            subscribers: RwLock::new(HashMap::new()),
            channel_history_limit,
        }
    }

    /// Create (or replace) a channel.
    pub fn create_channel(&self, channel_id: &str, kind: &str) -> String {
        let limit = self.channel_history_limit;
        let channel = Channel {
            kind: kind.to_string(),
            created_at: Utc::now(),
            subscribers: RwLock::new(BTreeSet::new()),
            history: BoundedHistory::new(limit, (limit / 2).max(1)),
        };
        self.channels
            .insert(channel_id.to_string(), Arc::new(channel));
        info!(channel_id = %channel_id, kind = %kind, "Channel created");
        channel_id.to_string()
    }

    /// Subscribe an id to an existing channel. Returns false if the channel
    /// does not exist.
    pub fn subscribe(&self, channel_id: &str, subscriber_id: &str) -> bool {
        match self.channels.get(channel_id) {
            Some(channel) => {
                channel
                    .subscribers
                    .write()
                    .insert(subscriber_id.to_string());
                debug!(channel_id = %channel_id, subscriber_id = %subscriber_id, "Subscribed to channel");
                true
            }
            None => {
                warn!(channel_id = %channel_id, subscriber_id = %subscriber_id, "Subscribe to unknown channel ignored");
                false
            }
        }
    }

    /// Attach the listener that receives messages for `subscriber_id`.
    pub fn register_listener(&self, subscriber_id: &str, listener: Arc<dyn ChannelListener>) {
        self.listeners.insert(subscriber_id.to_string(), listener);
    }

    /// Record a message in the channel history and notify every current
    /// subscriber. Returns `None` when the channel does not exist.
    pub async fn send_message(
        &self,
        channel_id: &str,
        content: Value,
        sender_id: &str,
    ) -> Option<Delivery> {
        let channel = self.channels.get(channel_id).map(|c| Arc::clone(c.value()))?;

        let message = ChannelMessage {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: Utc::now(),
            content,
        };
        channel.history.push(message.clone());

        let subscribers: Vec<String> = channel.subscribers.read().iter().cloned().collect();
        let mut delivery = Delivery::default();
        for subscriber_id in subscribers {
            let listener = self
                .listeners
                .get(&subscriber_id)
                .map(|l| Arc::clone(l.value()));
            let Some(listener) = listener else {
                debug!(channel_id = %channel_id, subscriber_id = %subscriber_id, "No listener for subscriber, skipping");
                continue;
            };
            match listener.on_message(&message).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    delivery.failed += 1;
                    warn!(
                        channel_id = %channel_id,
                        subscriber_id = %subscriber_id,
                        error = %e,
                        "Channel subscriber notification failed"
                    );
                }
            }
        }

        trace!(channel_id = %channel_id, message_id = %message.id, ?delivery, "Channel message sent");
        Some(delivery)
    }

    pub fn channel_history(&self, channel_id: &str) -> Vec<ChannelMessage> {
        self.channels
            .get(channel_id)
            .map(|channel| channel.history.snapshot())
            .unwrap_or_default()
    }

    /// Every channel, ordered by id.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .channels
            .iter()
            .map(|entry| {
                let channel = entry.value();
                ChannelInfo {
                    id: entry.key().clone(),
                    kind: channel.kind.clone(),
                    created_at: channel.created_at,
                    subscribers: channel.subscribers.read().iter().cloned().collect(),
                    history_len: channel.history.len(),
                }
            })
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    pub fn register_event_subscriber(&self, kind: EventKind, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    /// Deliver an event to every subscriber registered for its kind.
    pub async fn publish(&self, event: &Event) -> Delivery {
        let subscribers = self
            .subscribers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        let mut delivery = Delivery::default();
        for subscriber in subscribers {
            match subscriber.on_event(event).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    delivery.failed += 1;
                    warn!(
                        event_id = %event.id,
                        kind = %event.kind,
                        error = %e,
                        "Event subscriber failed"
                    );
                }
            }
        }

        trace!(event_id = %event.id, kind = %event.kind, ?delivery, "Event published");
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().push(event.id.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ChannelListener for Recorder {
        async fn on_message(&self, message: &ChannelMessage) -> anyhow::Result<()> {
            self.seen.lock().push(message.id.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSubscriber for Failing {
        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("subscriber exploded")
        }
    }

    #[async_trait]
    impl ChannelListener for Failing {
        async fn on_message(&self, _message: &ChannelMessage) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_kind_only() {
        let bus = EventBus::new(10);
        let captured = Arc::new(Recorder::default());
        let errors = Arc::new(Recorder::default());
        bus.register_event_subscriber(EventKind::ResultCaptured, captured.clone());
        bus.register_event_subscriber(EventKind::Error, errors.clone());

        let event = Event::new(EventKind::ResultCaptured, "test", "all", json!({}));
        let delivery = bus.publish(&event).await;

        assert_eq!(delivery, Delivery { delivered: 1, failed: 0 });
        assert_eq!(*captured.seen.lock(), vec![event.id.clone()]);
        assert!(errors.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::new(10);
        let before = Arc::new(Recorder::default());
        let after = Arc::new(Recorder::default());
        bus.register_event_subscriber(EventKind::StatusUpdate, before.clone());
        bus.register_event_subscriber(EventKind::StatusUpdate, Arc::new(Failing));
        bus.register_event_subscriber(EventKind::StatusUpdate, after.clone());

        let event = Event::new(EventKind::StatusUpdate, "test", "all", json!({}));
        let delivery = bus.publish(&event).await;

        assert_eq!(delivery, Delivery { delivered: 2, failed: 1 });
        assert_eq!(before.seen.lock().len(), 1);
        assert_eq!(after.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(10);
        let event = Event::new(EventKind::SyncCompleted, "test", "all", json!({}));
        assert_eq!(bus.publish(&event).await, Delivery::default());
    }

    #[tokio::test]
    async fn test_channel_message_reaches_subscribers_and_history() {
        let bus = EventBus::new(10);
        bus.create_channel("events", "events");
        let listener = Arc::new(Recorder::default());
        bus.register_listener("gui", listener.clone());
        bus.register_listener("broken", Arc::new(Failing));
        assert!(bus.subscribe("events", "gui"));
        assert!(bus.subscribe("events", "broken"));
        assert!(bus.subscribe("events", "no-listener"));

        let delivery = bus
            .send_message("events", json!({"type": "ping"}), "system")
            .await
            .unwrap();

        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });
        assert_eq!(listener.seen.lock().len(), 1);

        let history = bus.channel_history("events");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, "system");
        assert_eq!(history[0].content["type"], "ping");
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let bus = EventBus::new(10);
        assert!(!bus.subscribe("missing", "gui"));
        assert!(bus
            .send_message("missing", json!({}), "system")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_channel_history_is_bounded() {
        let bus = EventBus::new(4);
        bus.create_channel("status", "status");
        for i in 0..5 {
            bus.send_message("status", json!({ "n": i }), "system").await;
        }
        let history = bus.channel_history("status");
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().content["n"], 4);
    }

    #[tokio::test]
    async fn test_single_message_channel_keeps_latest() {
        let bus = EventBus::new(1);
        bus.create_channel("status", "status");
        for i in 0..3 {
            bus.send_message("status", json!({ "n": i }), "system").await;
        }
        let history = bus.channel_history("status");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content["n"], 2);

        let channels = bus.channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].kind, "status");
        assert_eq!(channels[0].history_len, 1);
    }
}
