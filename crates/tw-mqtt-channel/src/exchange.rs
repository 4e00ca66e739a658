//! Correlated request/response over publish/subscribe.
//!
//! An [`Exchange`] names a set of outcome topics, each tagged as an accepted
//! or rejected reply, plus an optional trigger publish. [`Exchange::perform`]
//! subscribes every outcome topic, publishes the trigger, and resolves on the
//! first message to arrive on any of them. The subscriptions it opened are
//! released on every exit path, including cancellation and a dropped future.

use rumqttc::QoS;
use serde::Serialize;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tw_protocol::{ErrorResponse, topics};

use crate::channel::{Channel, Message, SubscriptionHandle, to_json_payload};
use crate::error::{MqttError, MqttResult};

/// How a message on an outcome topic resolves the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classifier {
    Accepted,
    Rejected,
}

/// Body of a message that arrived on a rejected topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Structured(ErrorResponse),
    Unstructured { raw: String },
}

impl Rejection {
    pub fn from_payload(payload: &[u8]) -> Self {
        match ErrorResponse::parse(payload) {
            Some(body) => Rejection::Structured(body),
            None => Rejection::Unstructured {
                raw: String::from_utf8_lossy(payload).into_owned(),
            },
        }
    }

    pub fn into_error(self) -> MqttError {
        match self {
            Rejection::Structured(body) => MqttError::Rejected(body),
            Rejection::Unstructured { raw } => MqttError::UnstructuredRejection { raw },
        }
    }
}

/// The single result of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted { topic: String, payload: Vec<u8> },
    Rejected { topic: String, rejection: Rejection },
}

impl Outcome {
    /// The accepted payload, or the rejection as an error.
    pub fn into_payload(self) -> MqttResult<Vec<u8>> {
        match self {
            Outcome::Accepted { payload, .. } => Ok(payload),
            Outcome::Rejected { rejection, .. } => Err(rejection.into_error()),
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Outcome::Accepted { topic, .. } | Outcome::Rejected { topic, .. } => topic,
        }
    }
}

#[derive(Debug, Clone)]
struct Trigger {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
}

/// A request/response exchange waiting to be performed.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    outcomes: Vec<(String, Classifier)>,
    trigger: Option<Trigger>,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exchange resolved by the `accepted`/`rejected` siblings of `request`.
    /// The trigger still has to be set.
    pub fn request_reply(request: &str) -> Self {
        Self::new()
            .accepted(topics::accepted(request))
            .rejected(topics::rejected(request))
    }

    pub fn accepted(mut self, topic: impl Into<String>) -> Self {
        self.outcomes.push((topic.into(), Classifier::Accepted));
        self
    }

    pub fn rejected(mut self, topic: impl Into<String>) -> Self {
        self.outcomes.push((topic.into(), Classifier::Rejected));
        self
    }

    pub fn trigger(mut self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        self.trigger = Some(Trigger {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        });
        self
    }

    pub fn trigger_json<T: Serialize>(self, topic: impl Into<String>, body: &T, qos: QoS) -> MqttResult<Self> {
        let payload = to_json_payload(body)?;
        Ok(self.trigger(topic, payload, qos))
    }

    /// Outcome topics in subscription order.
    pub fn outcome_topics(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|(topic, _)| topic.as_str())
    }

    /// Run the exchange to its first outcome.
    ///
    /// Fails with the channel's error when a subscribe or the trigger publish
    /// fails, with [`MqttError::Cancelled`] when `cancel` fires first, and with
    /// [`MqttError::Closed`] when every delivery queue ends without a message.
    pub async fn perform<C>(self, channel: &C, cancel: &CancellationToken) -> MqttResult<Outcome>
    where
        C: Channel + ?Sized,
    {
        let label = self.label();
        let mut scope = CorrelationScope {
            channel,
            handles: Vec::new(),
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(MqttError::Cancelled(label.clone())),
            result = self.run(&mut scope) => result,
        };

        match &result {
            Ok(outcome) => tracing::debug!(exchange = %label, topic = outcome.topic(), "exchange resolved"),
            Err(e) => tracing::debug!(exchange = %label, error = %e, "exchange failed"),
        }
        drop(scope);
        result
    }

    async fn run<C>(self, scope: &mut CorrelationScope<'_, C>) -> MqttResult<Outcome>
    where
        C: Channel + ?Sized,
    {
        let mut deliveries = StreamMap::new();
        for (index, (topic, _)) in self.outcomes.iter().enumerate() {
            let subscription = scope.channel.subscribe(topic, QoS::AtLeastOnce).await?;
            let (handle, stream) = subscription.into_stream();
            scope.handles.push(handle);
            deliveries.insert(index, stream);
        }

        if let Some(trigger) = &self.trigger {
            scope
                .channel
                .publish(&trigger.topic, &trigger.payload, trigger.qos)
                .await?;
        }

        let Some((index, message)) = deliveries.next().await else {
            return Err(MqttError::Closed(self.label()));
        };
        let classifier = self.outcomes[index].1;
        Ok(resolve(classifier, message))
    }

    fn label(&self) -> String {
        match &self.trigger {
            Some(trigger) => trigger.topic.clone(),
            None => self.outcomes.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>().join(", "),
        }
    }
}

fn resolve(classifier: Classifier, message: Message) -> Outcome {
    match classifier {
        Classifier::Accepted => Outcome::Accepted {
            topic: message.topic,
            payload: message.payload,
        },
        Classifier::Rejected => {
            let rejection = Rejection::from_payload(&message.payload);
            if let Rejection::Unstructured { raw } = &rejection {
                tracing::warn!(topic = %message.topic, raw = %raw, "rejection body has no error shape");
            }
            Outcome::Rejected {
                topic: message.topic,
                rejection,
            }
        }
    }
}

/// Subscriptions owned by one exchange. Released when dropped, so the
/// release also runs when the exchange future is abandoned mid-wait.
struct CorrelationScope<'a, C: Channel + ?Sized> {
    channel: &'a C,
    handles: Vec<SubscriptionHandle>,
}

impl<C: Channel + ?Sized> Drop for CorrelationScope<'_, C> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.handles);
        tracing::debug!(count = handles.len(), "releasing correlation scope");
        self.channel.release(&handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChannel, MockEvent};
    use std::time::Duration;

    const GET: &str = "$aws/things/rpi-001/shadow/get";
    const GET_ACCEPTED: &str = "$aws/things/rpi-001/shadow/get/accepted";
    const GET_REJECTED: &str = "$aws/things/rpi-001/shadow/get/rejected";

    fn shadow_get() -> Exchange {
        Exchange::request_reply(GET).trigger(GET, b"{}".to_vec(), QoS::AtMostOnce)
    }

    #[tokio::test]
    async fn accepted_reply_resolves_and_releases_scope() {
        let mock = MockChannel::new();
        mock.reply_on_publish(GET, GET_ACCEPTED, br#"{"state":{}}"#);

        let outcome = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Accepted {
                topic: GET_ACCEPTED.into(),
                payload: br#"{"state":{}}"#.to_vec(),
            }
        );
        assert!(mock.active_filters().is_empty());
        assert_eq!(mock.unsubscribed(), vec![GET_ACCEPTED, GET_REJECTED]);
    }

    #[tokio::test]
    async fn subscriptions_precede_trigger() {
        let mock = MockChannel::new();
        mock.reply_on_publish(GET, GET_ACCEPTED, b"{}");

        shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap();

        let events = mock.events();
        assert_eq!(
            &events[..3],
            &[
                MockEvent::Subscribe(GET_ACCEPTED.into()),
                MockEvent::Subscribe(GET_REJECTED.into()),
                MockEvent::Publish(GET.into()),
            ]
        );
    }

    #[tokio::test]
    async fn reply_arriving_at_subscribe_time_is_kept() {
        let mock = MockChannel::new();
        mock.reply_on_subscribe(GET_ACCEPTED, GET_ACCEPTED, b"early");

        let payload = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap()
            .into_payload()
            .unwrap();

        assert_eq!(payload, b"early");
    }

    #[tokio::test]
    async fn structured_rejection_wins_over_late_accept() {
        let mock = MockChannel::new();
        mock.reply_on_publish(
            GET,
            GET_REJECTED,
            br#"{"code":404,"message":"No shadow exists with name: 'rpi-001'"}"#,
        );

        let outcome = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap();

        let Outcome::Rejected { rejection: Rejection::Structured(body), .. } = &outcome else {
            panic!("expected structured rejection, got {outcome:?}");
        };
        assert_eq!(body.status_code, 404);
        assert_eq!(mock.inject(GET_ACCEPTED, b"{}"), 0);
        assert!(matches!(outcome.into_payload(), Err(MqttError::Rejected(_))));
    }

    #[tokio::test]
    async fn unstructured_rejection_keeps_raw_body() {
        let mock = MockChannel::new();
        mock.reply_on_publish(GET, GET_REJECTED, b"throttled");

        let err = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap()
            .into_payload()
            .unwrap_err();

        match err {
            MqttError::UnstructuredRejection { raw } => assert_eq!(raw, "throttled"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(mock.active_filters().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_releases_earlier_subscriptions() {
        let mock = MockChannel::new();
        mock.fail_subscribe(GET_REJECTED);

        let err = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MqttError::Subscribe(_)));
        assert!(mock.published().is_empty());
        assert_eq!(mock.unsubscribed(), vec![GET_ACCEPTED]);
    }

    #[tokio::test]
    async fn publish_failure_releases_scope() {
        let mock = MockChannel::new();
        mock.fail_publish(GET);

        let err = shadow_get()
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MqttError::Publish(_)));
        assert!(mock.active_filters().is_empty());
    }

    #[tokio::test]
    async fn cancellation_while_waiting_releases_scope() {
        let mock = MockChannel::new();
        let cancel = CancellationToken::new();

        let canceller = async {
            while mock.published_to(GET).is_empty() {
                tokio::task::yield_now().await;
            }
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(shadow_get().perform(&mock, &cancel), canceller);

        assert!(matches!(result, Err(MqttError::Cancelled(_))));
        assert!(mock.active_filters().is_empty());
        assert_eq!(mock.unsubscribed().len(), 2);
    }

    #[tokio::test]
    async fn dropped_exchange_releases_scope() {
        let mock = MockChannel::new();
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            shadow_get().perform(&mock, &cancel),
        )
        .await;

        assert!(result.is_err(), "no reply was scripted");
        assert!(mock.active_filters().is_empty());
        assert_eq!(mock.unsubscribed().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_exchanges_on_same_topics_stay_isolated() {
        let mock = MockChannel::new();
        let cancel = CancellationToken::new();

        let first = shadow_get().perform(&mock, &cancel);
        let second = shadow_get().perform(&mock, &cancel);
        let reply = async {
            while mock.published_to(GET).len() < 2 {
                tokio::task::yield_now().await;
            }
            assert_eq!(mock.inject(GET_ACCEPTED, b"one"), 2);
        };
        let (first, second, ()) = tokio::join!(first, second, reply);

        assert_eq!(first.unwrap().into_payload().unwrap(), b"one");
        assert_eq!(second.unwrap().into_payload().unwrap(), b"one");
        assert!(mock.active_filters().is_empty());
    }

    #[tokio::test]
    async fn exchange_without_outcomes_is_closed() {
        let mock = MockChannel::new();
        let err = Exchange::new()
            .trigger("a/b", b"{}".to_vec(), QoS::AtMostOnce)
            .perform(&mock, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MqttError::Closed(_)));
    }

    #[test]
    fn request_reply_pairs_siblings() {
        let exchange = Exchange::request_reply(GET);
        let topics: Vec<&str> = exchange.outcome_topics().collect();
        assert_eq!(topics, vec![GET_ACCEPTED, GET_REJECTED]);
    }
}
