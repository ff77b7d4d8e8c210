//! Plain TCP transport

use super::{BrokerAddress, ByteStream, Scheme, Transport, TransportError};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens unencrypted TCP connections
///
/// TLS addresses are refused; wrap a TLS stack in another [`Transport`]
/// implementation to support them.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn open(&self, address: &BrokerAddress) -> Result<Box<dyn ByteStream>, TransportError> {
        if address.scheme == Scheme::Tls {
            return Err(TransportError::Unreachable(format!(
                "{address}: TLS is not supported by the TCP transport"
            )));
        }

        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| TransportError::Unreachable(format!("{address}: {e}")))?;
        stream.set_nodelay(self.nodelay)?;

        debug!(target: "mqtt_session", "TCP stream opened to {}", address);
        Ok(Box::new(stream))
    }
}
