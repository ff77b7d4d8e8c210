//! Network I/O for one connection
//!
//! A connection is a reader task decoding packets off the stream and a
//! writer task that is the only thing ever writing to it. Both report
//! failures on the inbound channel, so the event loop learns about a dead
//! stream from a single place.

use super::connection::build_connect_packet;
use crate::config::ClientConfig;
use crate::error::{MqttError, MqttResult};
use crate::protocol::{codec, CodecError, ConnAck, ConnectReturnCode, Packet};
use crate::transport::{BrokerAddress, ByteStream, Transport};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const READ_BUFFER_CAPACITY: usize = 4096;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) type Inbound = mpsc::UnboundedReceiver<MqttResult<Packet>>;

/// An established connection: CONNACK accepted, tasks running
pub(crate) struct Connection {
    outbound: Option<mpsc::UnboundedSender<Packet>>,
    pub(crate) inbound: Inbound,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Queue a packet on the serialized write path
    pub(crate) fn send(&self, packet: Packet) -> MqttResult<()> {
        trace!(target: "mqtt_session", "Queueing {:?}", packet.packet_type());
        self.outbound
            .as_ref()
            .ok_or(MqttError::TransportClosed)?
            .send(packet)
            .map_err(|_| MqttError::TransportClosed)
    }

    /// Flush queued writes, shut the stream down and stop both tasks
    pub(crate) async fn close(mut self) {
        self.outbound.take();
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.writer)
            .await
            .is_err()
        {
            debug!(target: "mqtt_session", "Writer did not drain in time, aborting");
            self.writer.abort();
        }
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Open the transport, send CONNECT and wait for an accepting CONNACK
pub(crate) async fn establish(
    transport: &dyn Transport,
    address: &BrokerAddress,
    config: &ClientConfig,
    client_id: &str,
) -> MqttResult<(Connection, ConnAck)> {
    let stream = transport
        .open(address)
        .await
        .map_err(|e| MqttError::connection_unavailable(e.to_string()))?;
    let mut connection = spawn_io(stream, config.session.max_packet_size);

    let connect = build_connect_packet(config, client_id);
    debug!(
        target: "mqtt_session",
        "Sending CONNECT for {} (clean_session={}, keep_alive={}s)",
        client_id, connect.clean_session, connect.keep_alive
    );
    connection
        .send(Packet::Connect(connect))
        .map_err(|_| MqttError::connection_unavailable("stream closed before CONNECT"))?;

    let first = tokio::time::timeout(config.connect_timeout(), connection.inbound.recv())
        .await
        .map_err(|_| {
            MqttError::connection_unavailable(format!(
                "no CONNACK within {:?}",
                config.connect_timeout()
            ))
        })?;

    match first {
        Some(Ok(Packet::ConnAck(connack))) if connack.code == ConnectReturnCode::Accepted => {
            Ok((connection, connack))
        }
        Some(Ok(Packet::ConnAck(connack))) => Err(MqttError::ConnectRejected(connack.code)),
        Some(Ok(other)) => Err(MqttError::protocol_violation(format!(
            "expected CONNACK, received {:?}",
            other.packet_type()
        ))),
        Some(Err(MqttError::TransportClosed)) | None => Err(MqttError::connection_unavailable(
            "connection closed before CONNACK",
        )),
        Some(Err(error)) => Err(error),
    }
}

fn spawn_io(stream: Box<dyn ByteStream>, max_packet_size: usize) -> Connection {
    let (read_half, write_half) = tokio::io::split(stream);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_loop(read_half, inbound_tx.clone(), max_packet_size));
    let writer = tokio::spawn(write_loop(write_half, outbound_rx, inbound_tx));

    Connection {
        outbound: Some(outbound_tx),
        inbound: inbound_rx,
        reader,
        writer,
    }
}

async fn read_loop(
    mut stream: ReadHalf<Box<dyn ByteStream>>,
    inbound: mpsc::UnboundedSender<MqttResult<Packet>>,
    max_packet_size: usize,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        match codec::decode_with_limit(&buf, max_packet_size) {
            Ok((packet, consumed)) => {
                buf.advance(consumed);
                trace!(target: "mqtt_session", "Received {:?}", packet.packet_type());
                if inbound.send(Ok(packet)).is_err() {
                    return;
                }
                continue;
            }
            Err(CodecError::Incomplete) => {}
            Err(error) => {
                let _ = inbound.send(Err(error.into()));
                return;
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(target: "mqtt_session", "Stream closed by peer");
                let _ = inbound.send(Err(MqttError::TransportClosed));
                return;
            }
            Ok(_) => {}
            Err(error) => {
                debug!(target: "mqtt_session", "Read failed: {}", error);
                let _ = inbound.send(Err(MqttError::TransportClosed));
                return;
            }
        }
    }
}

async fn write_loop(
    mut stream: WriteHalf<Box<dyn ByteStream>>,
    mut outbound: mpsc::UnboundedReceiver<Packet>,
    inbound: mpsc::UnboundedSender<MqttResult<Packet>>,
) {
    let mut buf = BytesMut::new();
    while let Some(packet) = outbound.recv().await {
        buf.clear();
        if let Err(error) = codec::encode(&packet, &mut buf) {
            let _ = inbound.send(Err(MqttError::protocol_violation(format!(
                "cannot encode {:?}: {}",
                packet.packet_type(),
                error
            ))));
            return;
        }
        let written = async {
            stream.write_all(&buf).await?;
            stream.flush().await
        }
        .await;
        if let Err(error) = written {
            debug!(target: "mqtt_session", "Write failed: {}", error);
            let _ = inbound.send(Err(MqttError::TransportClosed));
            return;
        }
    }
    let _ = stream.shutdown().await;
}
