/*!
The event bus delivers build status, progress, and log events to real-time
observers.

Delivery is best-effort at-least-once per subscriber through a bounded
per-subscriber queue; the publisher never blocks on a subscriber, and a
subscriber that falls behind its queue's high-water mark is dropped rather
than back-pressuring the orchestrator.  Events for one build reach each
subscriber in emission order; no cross-build ordering is promised.

The serde message types of the real-time control-plane protocol live here
too, for front-ends that bridge the bus onto a socket.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often a control-plane server pings its clients.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-subscriber queue depth; overflowing it drops the subscriber.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Status,
    Progress,
    Log,
    Completed,
    Failed,
    Cancelled,
}

serde_plain::derive_display_from_serialize!(EventKind);

/// One event on the bus, shaped like the wire protocol's server messages.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub build_id: String,
    /// Monotonic per build, so observers can spot their own gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// A live subscription; dropping it (or falling behind) detaches it.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

struct Subscriber {
    id: u64,
    /// When set, only events for this build are delivered.
    filter: Option<String>,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    sequences: HashMap<String, u64>,
}

pub struct EventBus {
    queue_depth: usize,
    inner: Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SUBSCRIBER_QUEUE_DEPTH)
    }
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                next_subscriber: 0,
                sequences: HashMap::new(),
            }),
        }
    }

    /// Publishes one event to every matching subscriber.  The sequence
    /// number is assigned here, under the same lock that fans out, so
    /// per-build emission order is exactly per-subscriber delivery order.
    pub fn publish(&self, kind: EventKind, build_id: &str, data: Value) {
        let mut inner = self.inner.lock().unwrap();

        let seq = inner
            .sequences
            .entry(build_id.to_string())
            .and_modify(|s| *s += 1)
            .or_insert(0);
        let event = Event {
            kind,
            build_id: build_id.to_string(),
            seq: *seq,
            timestamp: Utc::now(),
            data,
        };

        let mut dropped = Vec::new();
        for subscriber in &inner.subscribers {
            if let Some(filter) = &subscriber.filter {
                if filter != build_id {
                    continue;
                }
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscribers lose their seat, not the producers.
                    log::warn!("Dropping slow event subscriber {}", subscriber.id);
                    dropped.push(subscriber.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(subscriber.id);
                }
            }
        }
        inner
            .subscribers
            .retain(|subscriber| !dropped.contains(&subscriber.id));
    }

    /// Attaches a subscriber, optionally filtered to one build.
    pub fn subscribe(&self, filter: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|subscriber| subscriber.id != id);
    }

    /// Whether any live subscriber is watching the given build; retention
    /// GC keeps such builds around.
    pub fn has_subscriber_for(&self, build_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.subscribers.iter().any(|subscriber| {
            !subscriber.tx.is_closed()
                && subscriber
                    .filter
                    .as_ref()
                    .map(|filter| filter == build_id)
                    .unwrap_or(true)
        })
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

/// Messages a control-plane client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SubscribeBuild { build_id: String },
}

/// Non-event messages the server sends; events serialize themselves.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong,
    InitialStatus { data: Value },
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn delivery_in_order_with_sequences() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(None);

        bus.publish(EventKind::Created, "b-1", json!({"state": "queued"}));
        bus.publish(EventKind::Log, "b-1", json!({"message": "hello"}));
        bus.publish(EventKind::Status, "b-1", json!({"state": "preparing"}));

        let first = sub.rx.try_recv().unwrap();
        let second = sub.rx.try_recv().unwrap();
        let third = sub.rx.try_recv().unwrap();
        assert_eq!(
            (first.kind, first.seq),
            (EventKind::Created, 0)
        );
        assert_eq!((second.kind, second.seq), (EventKind::Log, 1));
        assert_eq!((third.kind, third.seq), (EventKind::Status, 2));
    }

    #[test]
    fn per_build_sequences_are_independent() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(None);
        bus.publish(EventKind::Created, "b-1", json!({}));
        bus.publish(EventKind::Created, "b-2", json!({}));
        bus.publish(EventKind::Log, "b-2", json!({}));

        assert_eq!(sub.rx.try_recv().unwrap().seq, 0);
        assert_eq!(sub.rx.try_recv().unwrap().seq, 0);
        assert_eq!(sub.rx.try_recv().unwrap().seq, 1);
    }

    #[test]
    fn filtered_subscription_sees_one_build() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Some("b-2".to_string()));
        bus.publish(EventKind::Log, "b-1", json!({}));
        bus.publish(EventKind::Log, "b-2", json!({}));

        let only = sub.rx.try_recv().unwrap();
        assert_eq!(only.build_id, "b-2");
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn slow_subscriber_is_dropped() {
        let bus = EventBus::new(2);
        let _sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);

        // Fill the queue past its high-water mark without draining.
        bus.publish(EventKind::Log, "b-1", json!({}));
        bus.publish(EventKind::Log, "b-1", json!({}));
        bus.publish(EventKind::Log, "b-1", json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_detaches() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(Some("b-1".to_string()));
        assert!(bus.has_subscriber_for("b-1"));
        assert!(!bus.has_subscriber_for("b-2"));
        bus.unsubscribe(sub.id);
        assert!(!bus.has_subscriber_for("b-1"));
    }

    #[test]
    fn event_wire_shape() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(None);
        bus.publish(EventKind::Progress, "b-9", json!({"percent": 40}));
        let event = sub.rx.try_recv().unwrap();
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], json!("progress"));
        assert_eq!(wire["build_id"], json!("b-9"));
        assert_eq!(wire["data"]["percent"], json!(40));
    }

    #[test]
    fn client_messages_parse() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));
        let sub: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_build","build_id":"b-3"}"#).unwrap();
        assert!(matches!(sub, ClientMessage::SubscribeBuild { build_id } if build_id == "b-3"));
    }
}
