//! In-memory transport and scripted broker
//!
//! [`MockTransport`] hands the client one half of a `tokio::io::duplex`
//! pipe per `open`; the other half arrives at the paired [`MockBroker`].
//! Tests drive the broker side packet by packet, so every QoS flow and
//! failure can be scripted without a network.

use crate::protocol::{codec, CodecError, ConnAck, Connect, ConnectReturnCode, Packet};
use crate::transport::{BrokerAddress, ByteStream, Transport, TransportError};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Transport whose streams end at a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    incoming: mpsc::UnboundedSender<DuplexStream>,
    failures: AtomicUsize,
    opened: AtomicUsize,
}

impl MockTransport {
    /// Create a transport and the broker that receives its connections
    pub fn new() -> (Arc<Self>, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            incoming: tx,
            failures: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        (transport, MockBroker { incoming: rx })
    }

    /// Make the next `count` opens fail as unreachable
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, failed ones included
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, address: &BrokerAddress) -> Result<Box<dyn ByteStream>, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::Unreachable(format!(
                "{address} refused (scripted)"
            )));
        }

        let (client, broker) = tokio::io::duplex(PIPE_CAPACITY);
        self.incoming
            .send(broker)
            .map_err(|_| TransportError::Unreachable(format!("{address} has no broker")))?;
        Ok(Box::new(client))
    }
}

/// Receiving end of a [`MockTransport`]
#[derive(Debug)]
pub struct MockBroker {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MockBroker {
    /// Wait for the client to open the next connection
    pub async fn accept(&mut self) -> Option<MockBrokerConnection> {
        self.incoming.recv().await.map(MockBrokerConnection::new)
    }

    /// Like [`accept`](Self::accept) but gives up after `timeout`
    pub async fn accept_within(&mut self, timeout: Duration) -> Option<MockBrokerConnection> {
        tokio::time::timeout(timeout, self.accept()).await.ok().flatten()
    }

    /// Accept the next connection and complete the handshake
    pub async fn accept_session(
        &mut self,
        session_present: bool,
    ) -> Option<(MockBrokerConnection, Connect)> {
        let mut connection = self.accept().await?;
        let connect = connection.expect_connect().await?;
        connection
            .send(&Packet::ConnAck(ConnAck {
                session_present,
                code: ConnectReturnCode::Accepted,
            }))
            .await
            .ok()?;
        Some((connection, connect))
    }
}

/// Broker side of one client connection
#[derive(Debug)]
pub struct MockBrokerConnection {
    stream: DuplexStream,
    buf: BytesMut,
}

impl MockBrokerConnection {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Next packet from the client; `None` once the client closed
    pub async fn recv(&mut self) -> Option<Packet> {
        loop {
            match codec::decode(&self.buf) {
                Ok((packet, consumed)) => {
                    self.buf.advance(consumed);
                    return Some(packet);
                }
                Err(CodecError::Incomplete) => {}
                Err(_) => return None,
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Next packet, skipping keep-alive pings
    pub async fn recv_non_ping(&mut self) -> Option<Packet> {
        loop {
            match self.recv().await? {
                Packet::PingReq => continue,
                packet => return Some(packet),
            }
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> io::Result<()> {
        let bytes = codec::encode_to_bytes(packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send_raw(&bytes).await
    }

    /// Write bytes as-is, for malformed input
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Read the CONNECT the client must send first
    pub async fn expect_connect(&mut self) -> Option<Connect> {
        match self.recv().await? {
            Packet::Connect(connect) => Some(connect),
            _ => None,
        }
    }

    /// Drop the connection without a DISCONNECT
    pub fn close(self) {
        drop(self);
    }
}

/// Records every call made on a shared observer
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Poll until `count` events are recorded or `timeout` passes
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl crate::client::ConnectionObserver for RecordingObserver {
    fn on_connect(&self, session_present: bool) {
        self.record(format!("connect session_present={session_present}"));
    }

    fn on_connection_lost(&self, error: &crate::error::MqttError) {
        self.record(format!("lost {error}"));
    }

    fn on_reconnecting(&self, attempt: u32, delay: Duration) {
        self.record(format!("reconnecting {attempt} after {delay:?}"));
    }

    fn on_handler_error(&self, topic: &str, error: &crate::error::HandlerError) {
        self.record(format!("handler error on {topic}: {error}"));
    }
}
