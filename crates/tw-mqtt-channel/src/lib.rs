//! MQTT channel for AWS IoT Core communication.
//!
//! Provides request/response semantics on top of MQTT for Thingwire devices:
//! - `Channel` trait for publish/subscribe/unsubscribe (mockable in tests)
//! - `MqttChannel` with TLS (mTLS) for production, fed by a `Router`
//! - `Exchange`, the correlated request/response primitive
//! - `ShadowClient` and `JobsClient` built on it
//! - `MockChannel` for testing without a broker

pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod jobs;
pub mod mock;
pub mod router;
pub mod shadows;
pub mod tls;

// Re-exports for convenience.
pub use channel::{Channel, Message, MqttChannel, Subscription, SubscriptionHandle};
pub use config::MqttConfig;
pub use error::{MqttError, MqttResult};
pub use exchange::{Classifier, Exchange, Outcome, Rejection};
pub use jobs::{JobNotifications, JobsClient};
pub use mock::MockChannel;
pub use router::{Router, SubAckTicket};
pub use shadows::{ShadowChanges, ShadowClient};
