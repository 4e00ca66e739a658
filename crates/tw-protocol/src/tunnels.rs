//! Secure tunneling notification payload and its validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only client mode a device-side watcher accepts.
pub const DESTINATION_MODE: &str = "destination";

/// The only service a device-side watcher proxies.
pub const SSH_SERVICE: &str = "SSH";

/// Payload published on `$aws/things/{thing}/tunnels/notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelNotification {
    #[serde(default)]
    pub client_access_token: String,
    #[serde(default)]
    pub client_mode: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub services: Vec<String>,
}

/// A notification that passed validation: a single-service SSH tunnel in
/// destination mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTunnel {
    pub access_token: String,
    pub region: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelNotificationError {
    #[error("tunnel notification is not valid JSON: {0}")]
    Malformed(String),
    #[error("tunnel client mode '{0}' is not \"destination\"")]
    ClientMode(String),
    #[error("tunnel services are empty")]
    NoServices,
    #[error("tunnel requests {0} services, expected exactly one")]
    MultipleServices(usize),
    #[error("tunnel service '{0}' is not \"SSH\"")]
    Service(String),
    #[error("tunnel notification carries no client access token")]
    MissingAccessToken,
}

impl TunnelNotification {
    pub fn parse(payload: &[u8]) -> Result<Self, TunnelNotificationError> {
        serde_json::from_slice(payload)
            .map_err(|e| TunnelNotificationError::Malformed(e.to_string()))
    }

    /// Check the notification describes a tunnel the watcher can serve.
    pub fn validate(self) -> Result<SshTunnel, TunnelNotificationError> {
        if self.client_mode != DESTINATION_MODE {
            return Err(TunnelNotificationError::ClientMode(self.client_mode));
        }
        match self.services.as_slice() {
            [] => return Err(TunnelNotificationError::NoServices),
            [service] if service != SSH_SERVICE => {
                return Err(TunnelNotificationError::Service(service.clone()));
            }
            [_] => {}
            many => return Err(TunnelNotificationError::MultipleServices(many.len())),
        }
        if self.client_access_token.is_empty() {
            return Err(TunnelNotificationError::MissingAccessToken);
        }

        Ok(SshTunnel {
            access_token: self.client_access_token,
            region: self.region,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_validate(payload: &str) -> Result<SshTunnel, TunnelNotificationError> {
        TunnelNotification::parse(payload.as_bytes())?.validate()
    }

    #[test]
    fn valid_ssh_destination() {
        let tunnel = parse_and_validate(
            r#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":["SSH"]}"#,
        )
        .unwrap();
        assert_eq!(tunnel.access_token, "tok");
        assert_eq!(tunnel.region, "us-east-1");
    }

    #[test]
    fn source_mode_rejected() {
        let err = parse_and_validate(
            r#"{"clientAccessToken":"tok","clientMode":"source","region":"us-east-1","services":["SSH"]}"#,
        )
        .unwrap_err();
        assert_eq!(err, TunnelNotificationError::ClientMode("source".into()));
    }

    #[test]
    fn multiple_services_rejected() {
        let err = parse_and_validate(
            r#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":["SSH","HTTP"]}"#,
        )
        .unwrap_err();
        assert_eq!(err, TunnelNotificationError::MultipleServices(2));
    }

    #[test]
    fn empty_services_rejected() {
        let err = parse_and_validate(
            r#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":[]}"#,
        )
        .unwrap_err();
        assert_eq!(err, TunnelNotificationError::NoServices);
    }

    #[test]
    fn non_ssh_service_rejected() {
        let err = parse_and_validate(
            r#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":["VNC"]}"#,
        )
        .unwrap_err();
        assert_eq!(err, TunnelNotificationError::Service("VNC".into()));
    }

    #[test]
    fn missing_token_rejected() {
        let err = parse_and_validate(
            r#"{"clientMode":"destination","region":"us-east-1","services":["SSH"]}"#,
        )
        .unwrap_err();
        assert_eq!(err, TunnelNotificationError::MissingAccessToken);
    }

    #[test]
    fn malformed_payload_rejected() {
        let err = parse_and_validate("not json").unwrap_err();
        assert!(matches!(err, TunnelNotificationError::Malformed(_)));
    }
}
