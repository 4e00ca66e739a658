//! AWS IoT Device Shadow MQTT operations.
//!
//! `get` and `delete` are correlated exchanges against the shadow's
//! accepted/rejected reply topics. `update` and `update_document` only
//! publish; callers that want the service's verdict keep a change
//! subscription open with [`ShadowClient::subscribe_for_changes`].

use rumqttc::QoS;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, Subscription, to_json_payload};
use crate::error::MqttResult;
use crate::exchange::Exchange;
use tw_protocol::shadows::{EMPTY_REQUEST, ShadowUpdate};
use tw_protocol::topics;

/// Shadow operations backed by a `Channel` implementation.
///
/// Addresses the classic shadow of a thing, or a named shadow when built
/// with [`ShadowClient::named`].
pub struct ShadowClient<'a, C: Channel + ?Sized> {
    channel: &'a C,
    thing_name: String,
    shadow_name: Option<String>,
}

/// Long-lived subscriptions to a shadow's update verdicts.
///
/// Both queues stay open until passed to
/// [`ShadowClient::unsubscribe_changes`]. Dropping them stops delivery but
/// leaves both routes and the broker subscriptions in place for the rest of
/// the session.
#[derive(Debug)]
pub struct ShadowChanges {
    pub accepted: Subscription,
    pub rejected: Subscription,
}

impl<'a, C: Channel + ?Sized> ShadowClient<'a, C> {
    pub fn new(channel: &'a C, thing_name: impl Into<String>) -> Self {
        Self {
            channel,
            thing_name: thing_name.into(),
            shadow_name: None,
        }
    }

    pub fn named(channel: &'a C, thing_name: impl Into<String>, shadow_name: impl Into<String>) -> Self {
        Self {
            channel,
            thing_name: thing_name.into(),
            shadow_name: Some(shadow_name.into()),
        }
    }

    fn shadow(&self) -> Option<&str> {
        self.shadow_name.as_deref()
    }

    /// Fetch the current shadow document.
    pub async fn get(&self, cancel: &CancellationToken) -> MqttResult<Vec<u8>> {
        let topic = topics::shadow_get(&self.thing_name, self.shadow());
        Exchange::request_reply(&topic)
            .trigger(topic.clone(), EMPTY_REQUEST, QoS::AtMostOnce)
            .perform(self.channel, cancel)
            .await?
            .into_payload()
    }

    /// Delete the shadow.
    pub async fn delete(&self, cancel: &CancellationToken) -> MqttResult<()> {
        let topic = topics::shadow_delete(&self.thing_name, self.shadow());
        Exchange::request_reply(&topic)
            .trigger(topic.clone(), EMPTY_REQUEST, QoS::AtMostOnce)
            .perform(self.channel, cancel)
            .await?
            .into_payload()?;
        tracing::info!(thing = %self.thing_name, shadow = ?self.shadow_name, "shadow deleted");
        Ok(())
    }

    /// Publish a shadow update document without waiting for its verdict.
    pub async fn update(&self, document: &[u8]) -> MqttResult<()> {
        let topic = topics::shadow_update(&self.thing_name, self.shadow());
        self.channel.publish(&topic, document, QoS::AtLeastOnce).await
    }

    /// Publish to the shadow's `update/documents` topic.
    pub async fn update_document(&self, document: &[u8]) -> MqttResult<()> {
        let topic = topics::shadow_update_documents(&self.thing_name, self.shadow());
        self.channel.publish(&topic, document, QoS::AtMostOnce).await
    }

    /// Publish arbitrary reported state as a shadow update.
    pub async fn report_state(&self, reported: serde_json::Value) -> MqttResult<()> {
        let bytes = to_json_payload(&ShadowUpdate::reported(reported))?;
        self.update(&bytes).await
    }

    /// Subscribe to the accepted and rejected topics of `update`.
    pub async fn subscribe_for_changes(&self) -> MqttResult<ShadowChanges> {
        let update = topics::shadow_update(&self.thing_name, self.shadow());
        let accepted = self
            .channel
            .subscribe(&topics::accepted(&update), QoS::AtLeastOnce)
            .await?;
        let rejected = match self
            .channel
            .subscribe(&topics::rejected(&update), QoS::AtLeastOnce)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.channel.release(&[accepted.handle().clone()]);
                return Err(e);
            }
        };
        Ok(ShadowChanges { accepted, rejected })
    }

    pub async fn unsubscribe_changes(&self, changes: ShadowChanges) -> MqttResult<()> {
        self.channel
            .unsubscribe(&[
                changes.accepted.handle().clone(),
                changes.rejected.handle().clone(),
            ])
            .await
    }
}
