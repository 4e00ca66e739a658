//! AWS IoT Jobs notifications.

use std::sync::Mutex;

use rumqttc::QoS;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tw_protocol::jobs::JobGetRequest;
use tw_protocol::topics;

use crate::channel::{Channel, Message, SubscriptionHandle};
use crate::error::MqttResult;
use crate::exchange::Exchange;

/// Jobs listener and next-job request for one thing.
pub struct JobsClient<'a, C: Channel + ?Sized> {
    channel: &'a C,
    thing_name: String,
    listening: Mutex<Vec<SubscriptionHandle>>,
}

/// Payloads from every jobs listener topic, merged into one queue.
///
/// The origin topic is not reported; callers tell notifications apart by
/// payload shape.
pub struct JobNotifications {
    topics: StreamMap<String, UnboundedReceiverStream<Message>>,
}

impl JobNotifications {
    /// Next payload from any listener topic. `None` once all of them have
    /// been unsubscribed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.topics.next().await.map(|(_, message)| message.payload)
    }
}

impl<'a, C: Channel + ?Sized> JobsClient<'a, C> {
    pub fn new(channel: &'a C, thing_name: impl Into<String>) -> Self {
        Self {
            channel,
            thing_name: thing_name.into(),
            listening: Mutex::new(Vec::new()),
        }
    }

    fn listener_topics(&self) -> [String; 4] {
        let get = topics::jobs_get(&self.thing_name);
        [
            topics::jobs_notify(&self.thing_name),
            topics::jobs_notify_next(&self.thing_name),
            topics::accepted(&get),
            topics::rejected(&get),
        ]
    }

    /// Subscribe to the four jobs listener topics and merge them.
    pub async fn listen(&self) -> MqttResult<JobNotifications> {
        let mut merged = StreamMap::new();
        let mut handles = Vec::new();

        for topic in self.listener_topics() {
            match self.channel.subscribe(&topic, QoS::AtLeastOnce).await {
                Ok(subscription) => {
                    let (handle, stream) = subscription.into_stream();
                    handles.push(handle);
                    merged.insert(topic, stream);
                }
                Err(e) => {
                    self.channel.release(&handles);
                    return Err(e);
                }
            }
        }

        tracing::info!(thing = %self.thing_name, "listening for job notifications");
        self.listening_handles().extend(handles);
        Ok(JobNotifications { topics: merged })
    }

    /// Ask for the next pending job execution and wait for the reply.
    pub async fn get_next(&self, cancel: &CancellationToken) -> MqttResult<Vec<u8>> {
        let get = topics::jobs_get(&self.thing_name);
        Exchange::new()
            .accepted(topics::jobs_next(&self.thing_name))
            .accepted(topics::jobs_next_notify(&self.thing_name))
            .accepted(topics::accepted(&get))
            .rejected(topics::rejected(&get))
            .trigger_json(get, &JobGetRequest::next(), QoS::AtMostOnce)?
            .perform(self.channel, cancel)
            .await?
            .into_payload()
    }

    /// Drop the listener subscriptions. Safe to call more than once.
    pub async fn unsubscribe_all(&self) -> MqttResult<()> {
        let handles = std::mem::take(&mut *self.listening_handles());
        if handles.is_empty() {
            return Ok(());
        }
        tracing::info!(thing = %self.thing_name, "stopped listening for job notifications");
        self.channel.unsubscribe(&handles).await
    }

    fn listening_handles(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.listening
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
