//! Error types for the MQTT session engine
//!
//! [`MqttError`] is the single error surfaced to applications. It is `Clone`
//! because one connection failure is fanned out to every waiting caller.
//! Lower layers (codec, transport) keep their own narrower enums and convert
//! into it at the session boundary.

use crate::client::connection::ConnectionState;
use crate::protocol::{CodecError, ConnectReturnCode, TopicError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MqttError {
    #[error("Broker refused connection: {0}")]
    ConnectRejected(ConnectReturnCode),

    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No PINGRESP received within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("Reconnection abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Session lost before the operation was acknowledged")]
    SessionLost,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Operation not valid in state {state:?}")]
    InvalidState { state: ConnectionState },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("All 65535 packet identifiers are in use")]
    PacketIdsExhausted,

    #[error("Client event loop has stopped")]
    ClientStopped,
}

impl MqttError {
    /// Whether this error ends the current network connection
    ///
    /// These are the failures that hand control to the reconnection
    /// supervisor.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            MqttError::ConnectionUnavailable(_)
                | MqttError::TransportClosed
                | MqttError::MalformedPacket(_)
                | MqttError::ProtocolViolation(_)
                | MqttError::KeepAliveTimeout(_)
        )
    }

    /// Create protocol violation error
    pub fn protocol_violation<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create connection unavailable error
    pub fn connection_unavailable<S: Into<String>>(message: S) -> Self {
        Self::ConnectionUnavailable(message.into())
    }
}

impl From<CodecError> for MqttError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Incomplete => MqttError::MalformedPacket("incomplete packet".to_string()),
            other => MqttError::MalformedPacket(other.to_string()),
        }
    }
}

/// Result type for client operations
pub type MqttResult<T> = Result<T, MqttError>;

/// Error returned by application message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
