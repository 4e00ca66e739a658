//! MQTT event loop driver.
//!
//! Polls the rumqttc event loop and feeds every event into the channel's
//! router, which delivers publishes and confirms subscriptions.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{ConnectReturnCode, Event, EventLoop, Packet, Request};
use tokio_util::sync::CancellationToken;
use tw_mqtt_channel::{MqttError, Router};

use crate::error::AgentResult;

/// Pause before polling again after a connection error.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Drive the MQTT event loop until `cancel` fires.
///
/// Intended to be spawned as a background tokio task. Connection errors
/// fail pending subscribe confirmations and discard the SUBSCRIBEs rumqttc
/// would replay for them, then polling resumes after [`RETRY_DELAY`] and
/// rumqttc reconnects.
pub async fn run(mut eventloop: EventLoop, router: Arc<Router>, cancel: CancellationToken) {
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(event) => {
                if let Event::Incoming(Packet::ConnAck(ack)) = &event {
                    tracing::info!(session_present = ack.session_present, "MQTT connected");
                }
                router.handle_event(&event);
            }
            Err(e) => {
                tracing::error!(error = %e, "MQTT event loop error, reconnecting in 5s");
                router.fail_pending(&e.to_string());
                discard_unconfirmed_subscribes(&mut eventloop);
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    tracing::debug!("MQTT event loop stopped");
}

/// Drop SUBSCRIBE requests queued for replay after reconnect. Their callers
/// were already failed, so a replayed SUBACK would confirm a newer
/// subscriber before the broker holds its subscription.
fn discard_unconfirmed_subscribes(eventloop: &mut EventLoop) {
    let before = eventloop.pending.len();
    eventloop
        .pending
        .retain(|request| !matches!(request, Request::Subscribe(_)));
    let discarded = before - eventloop.pending.len();
    if discarded > 0 {
        tracing::debug!(discarded, "dropped unconfirmed SUBSCRIBE requests");
    }
}

/// Poll until the broker accepts the connection.
pub async fn wait_connected(eventloop: &mut EventLoop, cancel: &CancellationToken) -> AgentResult<()> {
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(MqttError::Cancelled("connection".into()).into());
            }
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(MqttError::Connection(format!("broker refused connection: {:?}", ack.code)).into());
            }
            Ok(_) => {}
            Err(e) => return Err(MqttError::Connection(e.to_string()).into()),
        }
    }
}
