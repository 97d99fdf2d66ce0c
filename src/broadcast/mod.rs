//! Per-run pub/sub fan-out for live status observers.
//!
//! Each run gets a topic `run:<id>` backed by a `tokio::sync::broadcast`
//! channel. Messages are only delivered to receivers that exist at publish
//! time; a late subscriber gets its initial state from
//! [`Store::current_status`](crate::storage::Store::current_status) instead.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{Id, RunSnapshot, TestEvent};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Point-in-time state of the run.
    Status,
    /// A lifecycle event just committed for the run.
    Update,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: serde_json::Value,
}

impl Message {
    pub fn status(snapshot: &RunSnapshot) -> Self {
        Self {
            kind: MessageKind::Status,
            data: serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn update(event: &TestEvent) -> Self {
        Self {
            kind: MessageKind::Update,
            data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        }
    }
}

pub fn topic(run_id: Id) -> String {
    format!("run:{}", run_id)
}

#[derive(Default)]
pub struct Broadcaster {
    topics: Mutex<HashMap<String, broadcast::Sender<Message>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a receiver to `run:<run_id>`, creating the topic if needed.
    ///
    /// Topics whose receivers have all been dropped are pruned first.
    pub fn subscribe(&self, run_id: Id) -> broadcast::Receiver<Message> {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics.retain(|_, sender| sender.receiver_count() > 0);
        topics
            .entry(topic(run_id))
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Send to every current subscriber. Returns how many received it.
    ///
    /// With no subscribers this is a no-op and the topic is dropped.
    pub fn publish(&self, run_id: Id, message: Message) -> usize {
        let name = topic(run_id);
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        let delivered = match topics.get(&name) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            topics.remove(&name);
        }
        trace!(topic = %name, delivered, "published");
        delivered
    }

    pub fn publish_event(&self, event: &TestEvent) -> usize {
        self.publish(event.test_run_id, Message::update(event))
    }

    pub fn publish_status(&self, snapshot: &RunSnapshot) -> usize {
        self.publish(snapshot.run_id, Message::status(snapshot))
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, Severity};
    use chrono::Utc;

    fn event(run_id: Id, event_type: EventType) -> TestEvent {
        TestEvent {
            id: 1,
            test_run_id: run_id,
            event_type,
            severity: Severity::Info,
            description: "started".into(),
            details: serde_json::json!({}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(topic(42), "run:42");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let b = Broadcaster::new();
        assert_eq!(b.publish_event(&event(1, EventType::Start)), 0);
        assert_eq!(b.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_only_later_messages() {
        let b = Broadcaster::new();
        let mut early = b.subscribe(7);
        assert_eq!(b.publish_event(&event(7, EventType::Start)), 1);
        let mut late = b.subscribe(7);
        assert_eq!(b.publish_event(&event(7, EventType::Finish)), 2);

        assert_eq!(early.recv().await.unwrap().data["type"], "start");
        assert_eq!(early.recv().await.unwrap().data["type"], "finish");
        let only = late.recv().await.unwrap();
        assert_eq!(only.kind, MessageKind::Update);
        assert_eq!(only.data["type"], "finish");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let b = Broadcaster::new();
        let mut one = b.subscribe(1);
        let _two = b.subscribe(2);
        b.publish_event(&event(2, EventType::Start));
        assert!(one.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_release_their_topics() {
        let b = Broadcaster::new();
        for run_id in 0..100 {
            drop(b.subscribe(run_id));
        }
        assert!(b.topic_count() <= 1);

        let _held = b.subscribe(500);
        drop(b.subscribe(501));
        let _other = b.subscribe(502);
        assert_eq!(b.topic_count(), 2);
    }

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::to_value(Message::update(&event(3, EventType::Warning))).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["data"]["test_run_id"], 3);
    }
}
