//! Mock MQTT channel for testing without a real broker.
//!
//! Records publishes, subscriptions and unsubscriptions in call order and
//! routes inbound messages through the same [`Router`] the real channel
//! uses. Replies can be scripted to arrive when a topic is published to or
//! the instant a filter is subscribed.

use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::channel::{Channel, Subscription, SubscriptionHandle};
use crate::error::{MqttError, MqttResult};
use crate::router::Router;

/// A recorded publish call.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// One channel call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Subscribe(String),
    Publish(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    on: String,
    topic: String,
    payload: Vec<u8>,
}

/// Mock implementation of the `Channel` trait.
///
/// Thread-safe via `Mutex` (fine for test contexts).
pub struct MockChannel {
    router: Router,
    events: Mutex<Vec<MockEvent>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<String>>,
    publish_replies: Mutex<Vec<ScriptedReply>>,
    subscribe_replies: Mutex<Vec<ScriptedReply>>,
    failing_subscribes: Mutex<HashSet<String>>,
    failing_publishes: Mutex<HashSet<String>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            events: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            publish_replies: Mutex::new(Vec::new()),
            subscribe_replies: Mutex::new(Vec::new()),
            failing_subscribes: Mutex::new(HashSet::new()),
            failing_publishes: Mutex::new(HashSet::new()),
        }
    }

    // ── Scripting ─────────────────────────────────────────────

    /// Deliver `payload` on `reply_topic` the next time `request_topic` is
    /// published to. Each scripted reply fires once.
    pub fn reply_on_publish(&self, request_topic: &str, reply_topic: &str, payload: &[u8]) {
        self.publish_replies.lock().unwrap().push(ScriptedReply {
            on: request_topic.to_string(),
            topic: reply_topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Deliver `payload` on `topic` as soon as `filter` is subscribed, before
    /// the subscribe call returns.
    pub fn reply_on_subscribe(&self, filter: &str, topic: &str, payload: &[u8]) {
        self.subscribe_replies.lock().unwrap().push(ScriptedReply {
            on: filter.to_string(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Deliver an inbound message now. Returns how many subscriptions got it.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> usize {
        self.router.dispatch(topic, payload)
    }

    pub fn fail_subscribe(&self, filter: &str) {
        self.failing_subscribes.lock().unwrap().insert(filter.to_string());
    }

    pub fn fail_publish(&self, topic: &str) {
        self.failing_publishes.lock().unwrap().insert(topic.to_string());
    }

    // ── Inspection ────────────────────────────────────────────

    /// Every call made on the channel, in order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Get all subscribe calls ever made, including released ones.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Filters whose broker-side subscription was dropped, in order.
    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }

    /// Filters with at least one live subscription.
    pub fn active_filters(&self) -> Vec<String> {
        self.router.active_filters()
    }

    /// Get the last published message.
    pub fn last_published(&self) -> Option<PublishedMessage> {
        self.published.lock().unwrap().last().cloned()
    }

    /// Get published messages for a specific topic.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Check whether the given filter is currently subscribed.
    pub fn is_subscribed_to(&self, filter: &str) -> bool {
        self.router.active_filters().iter().any(|f| f == filter)
    }

    /// Clear recorded calls. Live subscriptions and scripts are kept.
    pub fn reset(&self) {
        self.events.lock().unwrap().clear();
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
        self.unsubscribed.lock().unwrap().clear();
    }

    fn take_replies(script: &Mutex<Vec<ScriptedReply>>, on: &str) -> Vec<ScriptedReply> {
        let mut script = script.lock().unwrap();
        let (fired, pending): (Vec<_>, Vec<_>) = script.drain(..).partition(|r| r.on == on);
        *script = pending;
        fired
    }

    fn drop_route(&self, handle: &SubscriptionHandle) {
        if self.router.remove(handle) {
            self.events
                .lock()
                .unwrap()
                .push(MockEvent::Unsubscribe(handle.filter.clone()));
            self.unsubscribed.lock().unwrap().push(handle.filter.clone());
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.events
            .lock()
            .unwrap()
            .push(MockEvent::Publish(topic.to_string()));
        if self.failing_publishes.lock().unwrap().contains(topic) {
            return Err(MqttError::Publish(format!("mock refused publish to '{topic}'")));
        }
        self.published.lock().unwrap().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        for reply in Self::take_replies(&self.publish_replies, topic) {
            self.router.dispatch(&reply.topic, &reply.payload);
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<Subscription> {
        self.events
            .lock()
            .unwrap()
            .push(MockEvent::Subscribe(filter.to_string()));
        if self.failing_subscribes.lock().unwrap().contains(filter) {
            return Err(MqttError::Subscribe(format!(
                "mock refused subscription to '{filter}'"
            )));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        let subscription = self.router.add(filter);
        for reply in Self::take_replies(&self.subscribe_replies, filter) {
            self.router.dispatch(&reply.topic, &reply.payload);
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, handles: &[SubscriptionHandle]) -> MqttResult<()> {
        self.release(handles);
        Ok(())
    }

    fn release(&self, handles: &[SubscriptionHandle]) {
        for handle in handles {
            self.drop_route(handle);
        }
    }
}
