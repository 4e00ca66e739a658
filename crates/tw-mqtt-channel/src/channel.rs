//! MQTT channel — async client for AWS IoT Core communication.
//!
//! Wraps `rumqttc::AsyncClient` behind the [`Channel`] trait. Inbound
//! publishes reach callers through per-subscription delivery queues fed by
//! the shared [`Router`].

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::router::Router;
use crate::tls;

// ── Delivery types ────────────────────────────────────────────

/// An inbound publish delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Identifies one subscribe call. Two subscriptions to the same filter get
/// distinct handles and are released independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub filter: String,
}

/// A live subscription: its handle plus the queue its messages arrive on.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    messages: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub(crate) fn new(handle: SubscriptionHandle, messages: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { handle, messages }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn filter(&self) -> &str {
        &self.handle.filter
    }

    /// Wait for the next message. Returns `None` once the subscription has
    /// been released.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.messages.try_recv().ok()
    }

    pub fn into_stream(self) -> (SubscriptionHandle, UnboundedReceiverStream<Message>) {
        (self.handle, UnboundedReceiverStream::new(self.messages))
    }
}

// ── Channel trait ─────────────────────────────────────────────

/// Abstraction for MQTT message publishing and subscribing.
///
/// Implementations must be safe to call concurrently from many exchanges
/// sharing one connection. Enables mocking in tests without a real broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()>;

    /// Subscribe to a topic filter. Resolves once the broker has confirmed
    /// the subscription; messages arriving after that are queued on the
    /// returned [`Subscription`].
    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<Subscription>;

    /// Release subscriptions, waiting until the unsubscribe requests are queued.
    async fn unsubscribe(&self, handles: &[SubscriptionHandle]) -> MqttResult<()>;

    /// Release subscriptions without waiting. Used from `Drop`, where no
    /// await point is available; failures are logged, not returned.
    fn release(&self, handles: &[SubscriptionHandle]);
}

/// Serialize a request body to JSON bytes.
pub fn to_json_payload<T: Serialize>(value: &T) -> MqttResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| MqttError::Serialization(e.to_string()))
}

// ── MqttChannel ───────────────────────────────────────────────

/// MQTT channel connected to AWS IoT Core.
///
/// Owns the `AsyncClient` for publishing/subscribing. The `EventLoop`
/// is returned separately from `new()` — the caller must drive it and hand
/// every event to [`MqttChannel::router`]:
/// ```ignore
/// let router = channel.router();
/// tokio::spawn(async move {
///     loop {
///         match eventloop.poll().await {
///             Ok(event) => router.handle_event(&event),
///             Err(e) => {
///                 router.fail_pending(&e.to_string());
///                 eventloop.pending.retain(|r| !matches!(r, Request::Subscribe(_)));
///                 tokio::time::sleep(Duration::from_secs(5)).await;
///             }
///         }
///     }
/// });
/// ```
pub struct MqttChannel {
    client: AsyncClient,
    router: Arc<Router>,
    // Keeps SUBSCRIBE packets in the same order as their pending SUBACKs.
    subscribe_order: Mutex<()>,
    thing_name: String,
}

impl MqttChannel {
    /// Create a new MQTT channel. Uses mTLS unless `use_tls` is off
    /// (local development brokers).
    pub fn new(config: &MqttConfig, thing_name: impl Into<String>) -> MqttResult<(Self, EventLoop)> {
        let thing_name = thing_name.into();

        let mut options = MqttOptions::new(
            config.client_id_or(&thing_name),
            &config.broker_host,
            config.broker_port,
        );
        options.set_keep_alive(std::time::Duration::from_secs(config.keepalive_secs.into()));

        if config.use_tls {
            options.set_transport(tls::load_tls_transport(config)?);
        } else {
            tracing::warn!(host = %config.broker_host, "TLS disabled, connecting in plaintext");
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        Ok((Self::with_client(client, thing_name), eventloop))
    }

    fn with_client(client: AsyncClient, thing_name: String) -> Self {
        Self {
            client,
            router: Arc::new(Router::new()),
            subscribe_order: Mutex::new(()),
            thing_name,
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// The router the event loop driver must feed.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    fn unsubscribe_now(&self, handle: &SubscriptionHandle) {
        if self.router.remove(handle) {
            if let Err(e) = self.client.try_unsubscribe(handle.filter.as_str()) {
                tracing::warn!(filter = %handle.filter, error = %e, "failed to queue unsubscribe");
            }
        }
    }
}

/// Removes a route whose subscribe call was abandoned before it returned.
struct PendingRoute<'a> {
    channel: &'a MqttChannel,
    handle: Option<SubscriptionHandle>,
}

impl PendingRoute<'_> {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for PendingRoute<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.channel.unsubscribe_now(&handle);
        }
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> MqttResult<Subscription> {
        // Route first, so a reply racing the SUBACK is still queued.
        let subscription = self.router.add(filter);
        let pending = PendingRoute {
            channel: self,
            handle: Some(subscription.handle().clone()),
        };

        let confirmation = {
            let _order = self.subscribe_order.lock().await;
            let (ticket, confirmation) = self.router.expect_suback(filter);
            self.client
                .subscribe(filter, qos)
                .await
                .map_err(|e| MqttError::Subscribe(e.to_string()))?;
            ticket.sent();
            confirmation
        };

        match confirmation.await {
            Ok(Ok(())) => {
                pending.disarm();
                tracing::debug!(filter, id = subscription.handle().id, "subscribed");
                Ok(subscription)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::Connection(format!(
                "confirmation for '{filter}' dropped"
            ))),
        }
    }

    async fn unsubscribe(&self, handles: &[SubscriptionHandle]) -> MqttResult<()> {
        let mut first_error = None;
        for handle in handles {
            if !self.router.remove(handle) {
                continue;
            }
            if let Err(e) = self.client.unsubscribe(handle.filter.as_str()).await {
                tracing::warn!(filter = %handle.filter, error = %e, "unsubscribe failed");
                first_error.get_or_insert(MqttError::Unsubscribe(e.to_string()));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn release(&self, handles: &[SubscriptionHandle]) {
        for handle in handles {
            self.unsubscribe_now(handle);
        }
    }
}
