//! Agent error types.

use thiserror::Error;
use tw_mqtt_channel::MqttError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Mqtt(#[from] MqttError),

    /// Credential material could not be written to durable storage.
    #[error("failed to persist {artifact}: {reason}")]
    Persistence { artifact: String, reason: String },

    #[error("proxy launch failed: {0}")]
    ProxyLaunch(String),

    #[error("device identity: {0}")]
    Identity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tunnel watcher has already launched a proxy")]
    TunnelAlreadyTriggered,
}

pub type AgentResult<T> = Result<T, AgentError>;
