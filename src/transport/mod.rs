//! Transport collaborator
//!
//! The session engine never touches sockets directly. It asks a
//! [`Transport`] to open a byte stream to a [`BrokerAddress`] and then owns
//! that stream: one reader task pulls bytes, one writer task pushes them.
//! Dropping or shutting down the stream closes it.

use crate::config::ConfigError;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

pub mod tcp;

pub use tcp::TcpTransport;

/// Bidirectional byte stream to a broker
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens byte streams to a broker
///
/// Implementations are shared between the initial connect and every
/// reconnection attempt, so `open` takes `&self`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, address: &BrokerAddress) -> Result<Box<dyn ByteStream>, TransportError>;
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Stream closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for crate::error::MqttError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => crate::error::MqttError::TransportClosed,
            other => crate::error::MqttError::ConnectionUnavailable(other.to_string()),
        }
    }
}

/// URL scheme family of a broker address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

/// Parsed broker location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://`, `ssl://`, `tls://` or `mqtts://` URLs
    pub fn parse(server: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(server).map_err(|_| ConfigError::InvalidBrokerUrl(server.to_string()))?;

        let scheme = match url.scheme() {
            "tcp" | "mqtt" => Scheme::Tcp,
            "ssl" | "tls" | "mqtts" => Scheme::Tls,
            _ => return Err(ConfigError::InvalidBrokerUrl(server.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(server.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let port = url.port().unwrap_or(match scheme {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        });

        Ok(Self { scheme, host, port })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_ports() {
        let address = BrokerAddress::parse("tcp://127.0.0.1").unwrap();
        assert_eq!(address.port, 1883);
        assert_eq!(address.scheme, Scheme::Tcp);

        let address = BrokerAddress::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(address.port, 8883);
        assert_eq!(address.scheme, Scheme::Tls);
    }

    #[test]
    fn test_parse_explicit_port_and_ipv6() {
        let address = BrokerAddress::parse("mqtt://localhost:1884").unwrap();
        assert_eq!(address.host, "localhost");
        assert_eq!(address.port, 1884);

        let address = BrokerAddress::parse("tcp://[::1]:1883").unwrap();
        assert_eq!(address.host, "::1");
        assert_eq!(address.to_string(), "tcp://[::1]:1883");
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            BrokerAddress::parse("http://localhost"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
        assert!(BrokerAddress::parse("localhost:1883").is_err());
        assert!(BrokerAddress::parse("invalid-url").is_err());
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: crate::error::MqttError = TransportError::Closed.into();
        assert_eq!(error, crate::error::MqttError::TransportClosed);

        let error: crate::error::MqttError =
            TransportError::Unreachable("refused".to_string()).into();
        assert!(matches!(
            error,
            crate::error::MqttError::ConnectionUnavailable(_)
        ));
    }
}
