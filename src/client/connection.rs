//! Pure connection state management
//!
//! Connection state, and the pure function that turns a [`ClientConfig`]
//! into the CONNECT packet sent on every (re)connect.

use crate::config::ClientConfig;
use crate::protocol::{Connect, LastWill, QoS};
use bytes::Bytes;
use std::fmt;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, and terminal state after an explicit disconnect
    Disconnected,
    /// CONNECT sent, waiting for CONNACK
    Connecting,
    /// CONNACK accepted; operations may be issued
    Connected,
    /// Explicit disconnect in progress
    Disconnecting,
    /// Connection lost; waiting out backoff before the given attempt
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Build the CONNECT packet for `client_id` from configuration
///
/// Credentials are resolved from the environment here, so a rotated
/// password is picked up by the next reconnect.
pub fn build_connect_packet(config: &ClientConfig, client_id: &str) -> Connect {
    let keep_alive = u16::try_from(config.session.keep_alive_secs).unwrap_or(u16::MAX);

    let last_will = config.will.as_ref().map(|will| LastWill {
        topic: will.topic.clone(),
        payload: Bytes::from(will.payload.clone().into_bytes()),
        qos: QoS::try_from(will.qos).unwrap_or(QoS::AtMostOnce),
        retain: will.retain,
    });

    // A password without a user name is not allowed on the wire
    let username = config.username();
    let password = username
        .as_ref()
        .and(config.password())
        .map(|password| Bytes::from(password.into_bytes()));

    Connect {
        protocol: config.protocol_version(),
        client_id: client_id.to_string(),
        clean_session: config.session.clean_session,
        keep_alive,
        last_will,
        username,
        password,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WillSection;
    use crate::protocol::ProtocolVersion;

    #[test]
    fn test_connect_packet_from_defaults() {
        let config = ClientConfig::default();
        let connect = build_connect_packet(&config, "client-1");

        assert_eq!(connect.client_id, "client-1");
        assert_eq!(connect.protocol, ProtocolVersion::V311);
        assert!(connect.clean_session);
        assert_eq!(connect.keep_alive, 60);
        assert!(connect.last_will.is_none());
        assert!(connect.username.is_none());
        assert!(connect.password.is_none());
    }

    #[test]
    fn test_connect_packet_carries_will_and_session_flags() {
        let mut config = ClientConfig::default();
        config.session.clean_session = false;
        config.session.protocol_version = 3;
        config.will = Some(WillSection {
            topic: "status/client-1".to_string(),
            payload: "gone".to_string(),
            qos: 1,
            retain: true,
        });

        let connect = build_connect_packet(&config, "client-1");
        assert!(!connect.clean_session);
        assert_eq!(connect.protocol, ProtocolVersion::V31);

        let will = connect.last_will.unwrap();
        assert_eq!(will.topic, "status/client-1");
        assert_eq!(will.payload, Bytes::from_static(b"gone"));
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_credentials_from_environment() {
        let mut config = ClientConfig::default();
        config.broker.username_env = Some("MQTTSUB_TEST_CONNECT_USER".to_string());
        config.broker.password_env = Some("MQTTSUB_TEST_CONNECT_PASS".to_string());
        std::env::set_var("MQTTSUB_TEST_CONNECT_USER", "alice");
        std::env::set_var("MQTTSUB_TEST_CONNECT_PASS", "secret");

        let connect = build_connect_packet(&config, "client-1");
        assert_eq!(connect.username.as_deref(), Some("alice"));
        assert_eq!(connect.password, Some(Bytes::from_static(b"secret")));

        std::env::remove_var("MQTTSUB_TEST_CONNECT_USER");
        std::env::remove_var("MQTTSUB_TEST_CONNECT_PASS");
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting(3).to_string(),
            "reconnecting (attempt 3)"
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting(1).is_connected());
    }
}
