//! MQTT channel error types.

use thiserror::Error;
use tw_protocol::ErrorResponse;

/// Errors that can occur during MQTT operations and correlated exchanges.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("unsubscribe error: {0}")]
    Unsubscribe(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The cloud replied on a rejected topic with a structured error body.
    #[error("request rejected {}", describe_rejection(.0))]
    Rejected(ErrorResponse),

    /// The cloud replied on a rejected topic but the body had no recognizable error shape.
    #[error("request rejected: {raw}")]
    UnstructuredRejection { raw: String },

    /// A reply violated an invariant of its workflow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cancelled while waiting for a reply on {0}")]
    Cancelled(String),

    /// Every delivery queue of a correlation scope ended before a reply arrived.
    #[error("subscriptions closed before a reply arrived on {0}")]
    Closed(String),
}

fn describe_rejection(body: &ErrorResponse) -> String {
    if body.error_code.is_empty() {
        format!("({}): {}", body.status_code, body.error_message)
    } else {
        format!(
            "({} {}): {}",
            body.status_code, body.error_code, body.error_message
        )
    }
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;
