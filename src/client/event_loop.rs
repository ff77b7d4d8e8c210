//! Session event loop and reconnection supervisor
//!
//! One task owns the [`Session`] for its whole life. It multiplexes
//! application commands, inbound packets and keep-alive deadlines, and on
//! connection loss runs the backoff loop in place. Application handles
//! talk to it only through the command channel and observe it through the
//! state `watch` channel.

use super::connection::ConnectionState;
use super::dispatcher::MessageHandler;
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::keepalive::{KeepAlive, KeepAliveAction};
use super::network::{establish, Connection};
use super::observer::{Notification, Notifier};
use super::pending::Completion;
use super::reconnect::ReconnectConfig;
use super::session::Session;
use crate::config::ClientConfig;
use crate::error::{MqttError, MqttResult};
use crate::mqtt_span;
use crate::protocol::{ConnAck, Packet, Publish, QoS};
use crate::transport::{BrokerAddress, Transport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Requests from application handles
pub(crate) enum Command {
    Publish {
        publish: Publish,
        completion: Completion,
        accepted: oneshot::Sender<MqttResult<Option<u16>>>,
    },
    Subscribe {
        filters: Vec<(String, QoS)>,
        handler: Option<Arc<dyn MessageHandler>>,
        completion: Completion,
        accepted: oneshot::Sender<MqttResult<u16>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        completion: Completion,
        accepted: oneshot::Sender<MqttResult<u16>>,
    },
    /// Caller stopped waiting for this operation
    Abandon { packet_id: u16 },
    SetDefaultHandler(Option<Arc<dyn MessageHandler>>),
    Disconnect { done: oneshot::Sender<()> },
}

/// Why serving a connection ended
enum Exit {
    Disconnect(Option<oneshot::Sender<()>>),
    Lost(MqttError),
}

/// A disconnect request that arrived while waiting on something else
type Interrupted = Option<oneshot::Sender<()>>;

pub(crate) struct EventLoop {
    config: ClientConfig,
    client_id: String,
    address: BrokerAddress,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    notifier: Notifier,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ClientConfig,
        client_id: String,
        address: BrokerAddress,
        transport: Arc<dyn Transport>,
        session: Session,
        commands: mpsc::UnboundedReceiver<Command>,
        state: Arc<watch::Sender<ConnectionState>>,
        notifier: Notifier,
    ) -> Self {
        let reconnect = config.reconnect_config();
        Self {
            config,
            client_id,
            address,
            transport,
            reconnect,
            session,
            commands,
            state,
            notifier,
        }
    }

    /// Spawn the loop; `connected` receives the outcome of the first connect
    pub(crate) fn spawn(self, connected: oneshot::Sender<MqttResult<ConnAck>>) {
        let span = mqtt_span!(client_id = %self.client_id, broker = %self.address);
        tokio::spawn(self.run(connected).instrument(span));
    }

    async fn run(mut self, connected: oneshot::Sender<MqttResult<ConnAck>>) {
        self.apply_event(ConnectionEvent::ConnectStarted);

        let mut connection = match self.interruptible(self.connect_future()).await {
            Ok(Ok((connection, connack))) => {
                self.activate(&connection, connack);
                let _ = connected.send(Ok(connack));
                connection
            }
            Ok(Err(error)) => {
                warn!("Initial connection to {} failed: {}", self.address, error);
                self.stop(MqttError::SessionLost, None);
                let _ = connected.send(Err(error));
                return;
            }
            Err(done) => {
                self.stop(MqttError::Cancelled, done);
                let _ = connected.send(Err(MqttError::Cancelled));
                return;
            }
        };

        loop {
            match self.serve(&mut connection).await {
                Exit::Disconnect(done) => {
                    self.disconnect(connection, done).await;
                    return;
                }
                Exit::Lost(error) => {
                    debug_assert!(error.is_connection_failure());
                    drop(connection);
                    error!("MQTT connection lost: {}", error);
                    self.session.on_connection_lost();
                    self.apply_event(ConnectionEvent::ConnectionLost(error));

                    if !self.config.reconnect.enabled {
                        self.stop(MqttError::SessionLost, None);
                        return;
                    }
                    match self.supervise_reconnect().await {
                        Some(reconnected) => connection = reconnected,
                        None => return,
                    }
                }
            }
        }
    }

    fn connect_future(&self) -> impl Future<Output = MqttResult<(Connection, ConnAck)>> {
        let transport = self.transport.clone();
        let address = self.address.clone();
        let config = self.config.clone();
        let client_id = self.client_id.clone();
        async move { establish(transport.as_ref(), &address, &config, &client_id).await }
    }

    /// Serve one live connection until it is lost or a disconnect arrives
    async fn serve(&mut self, connection: &mut Connection) -> Exit {
        let mut keep_alive = KeepAlive::new(
            self.config.keep_alive(),
            self.config.ping_timeout(),
            Instant::now(),
        );

        loop {
            let deadline = keep_alive.next_deadline();
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.commands.recv() => {
                    let packets = match command {
                        None => return Exit::Disconnect(None),
                        Some(Command::Disconnect { done }) => return Exit::Disconnect(Some(done)),
                        Some(command) => self.handle_command(command),
                    };
                    if let Err(error) = send_all(connection, packets, &mut keep_alive) {
                        return Exit::Lost(error);
                    }
                }
                inbound = connection.inbound.recv() => {
                    let packet = match inbound {
                        Some(Ok(packet)) => packet,
                        Some(Err(error)) => return Exit::Lost(error),
                        None => return Exit::Lost(MqttError::TransportClosed),
                    };
                    if packet == Packet::PingResp {
                        if !keep_alive.record_pong() {
                            debug!(target: "mqtt_session", "Unsolicited PINGRESP");
                        }
                        continue;
                    }
                    let replies = match self.session.handle_packet(packet) {
                        Ok(replies) => replies,
                        Err(error) => {
                            warn!("Protocol violation from broker: {}", error);
                            return Exit::Lost(error);
                        }
                    };
                    if let Err(error) = send_all(connection, replies, &mut keep_alive) {
                        return Exit::Lost(error);
                    }
                }
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    match keep_alive.poll(Instant::now()) {
                        KeepAliveAction::SendPing => {
                            debug!(target: "mqtt_session", "Sending PINGREQ");
                            if let Err(error) = connection.send(Packet::PingReq) {
                                return Exit::Lost(error);
                            }
                            keep_alive.ping_sent(Instant::now());
                        }
                        KeepAliveAction::TimedOut => {
                            return Exit::Lost(MqttError::KeepAliveTimeout(keep_alive.ping_timeout()));
                        }
                        KeepAliveAction::Wait => {}
                    }
                }
            }
        }
    }

    /// Apply a command; returns packets to write if online
    fn handle_command(&mut self, command: Command) -> Vec<Packet> {
        match command {
            Command::Publish {
                publish,
                completion,
                accepted,
            } => match self.session.publish(publish, Some(completion)) {
                Ok((packet_id, packets)) => {
                    let _ = accepted.send(Ok(packet_id));
                    packets
                }
                Err(error) => {
                    let _ = accepted.send(Err(error));
                    Vec::new()
                }
            },
            Command::Subscribe {
                filters,
                handler,
                completion,
                accepted,
            } => {
                let result = self.require_online().and_then(|()| {
                    self.session.subscribe(filters, handler, Some(completion))
                });
                accept(result, accepted)
            }
            Command::Unsubscribe {
                filters,
                completion,
                accepted,
            } => {
                let result = self
                    .require_online()
                    .and_then(|()| self.session.unsubscribe(filters, Some(completion)));
                accept(result, accepted)
            }
            Command::Abandon { packet_id } => {
                self.session.abandon(packet_id);
                Vec::new()
            }
            Command::SetDefaultHandler(handler) => {
                self.session.set_default_handler(handler);
                Vec::new()
            }
            Command::Disconnect { done } => {
                // Handled by the callers of handle_command
                let _ = done.send(());
                Vec::new()
            }
        }
    }

    fn require_online(&self) -> MqttResult<()> {
        if self.session.is_online() {
            Ok(())
        } else {
            Err(MqttError::NotConnected {
                state: *self.state.borrow(),
            })
        }
    }

    /// Run `future` while still serving commands
    ///
    /// Returns `Err` if a disconnect was requested (or every handle was
    /// dropped) before the future finished; the future is dropped then.
    async fn interruptible<F: Future>(&mut self, future: F) -> Result<F::Output, Interrupted> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Ok(output),
                command = self.commands.recv() => match command {
                    None => return Err(None),
                    Some(Command::Disconnect { done }) => return Err(Some(done)),
                    Some(command) => {
                        let packets = self.handle_command(command);
                        debug_assert!(packets.is_empty());
                    }
                }
            }
        }
    }

    /// Back off and reconnect until success, a disconnect, or giving up
    async fn supervise_reconnect(&mut self) -> Option<Connection> {
        if let Some(total) = self.reconnect.calculate_max_total_time() {
            debug!("Reconnection gives up after {:?} of backoff", total);
        }
        let mut attempts = 0u32;
        loop {
            match HealthMonitor::should_attempt_reconnection(attempts, &self.reconnect, false) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    attempts = attempt;
                    let max_display = self
                        .reconnect
                        .max_attempts
                        .map_or("∞".to_string(), |max| max.to_string());
                    info!(
                        "Attempting reconnection {}/{} after {:?} delay",
                        attempt, max_display, delay
                    );
                    self.apply_event(ConnectionEvent::Reconnecting { attempt, delay });

                    if let Err(done) = self.interruptible(tokio::time::sleep(delay)).await {
                        info!("Disconnect requested during reconnection delay, stopping");
                        self.stop(MqttError::Cancelled, done);
                        return None;
                    }

                    match self.interruptible(self.connect_future()).await {
                        Ok(Ok((connection, connack))) => {
                            self.activate(&connection, connack);
                            return Some(connection);
                        }
                        Ok(Err(error @ MqttError::ConnectRejected(_))) => {
                            error!("Broker refused reconnection: {}", error);
                            self.stop(MqttError::SessionLost, None);
                            self.notifier.notify(Notification::ConnectionLost(error));
                            return None;
                        }
                        Ok(Err(error)) => {
                            warn!("Reconnection attempt {} failed: {}", attempt, error);
                        }
                        Err(done) => {
                            info!("Disconnect requested during reconnection, stopping");
                            self.stop(MqttError::Cancelled, done);
                            return None;
                        }
                    }
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let error = MqttError::ReconnectExhausted { attempts };
                    error!("{}", error);
                    self.stop(MqttError::SessionLost, None);
                    self.notifier.notify(Notification::ConnectionLost(error));
                    return None;
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    self.stop(MqttError::Cancelled, None);
                    return None;
                }
            }
        }
    }

    /// CONNACK accepted on `connection`: go online and flush session state
    fn activate(&mut self, connection: &Connection, connack: ConnAck) {
        self.apply_event(ConnectionEvent::Connected {
            session_present: connack.session_present,
        });

        let packets = match self.session.on_connected(connack.session_present) {
            Ok(packets) => packets,
            Err(error) => {
                warn!("Could not restore session state: {}", error);
                Vec::new()
            }
        };
        for packet in packets {
            // A failed write surfaces on the inbound channel
            if connection.send(packet).is_err() {
                break;
            }
        }
    }

    async fn disconnect(&mut self, connection: Connection, done: Option<oneshot::Sender<()>>) {
        self.apply_event(ConnectionEvent::DisconnectRequested);
        if connection.send(Packet::Disconnect).is_err() {
            debug!(target: "mqtt_session", "Transport already broken, skipping DISCONNECT");
        }
        connection.close().await;
        self.stop(MqttError::Cancelled, done);
        info!("MQTT client disconnected");
    }

    /// Terminal transition: fail everything outstanding and go Disconnected
    fn stop(&mut self, error: MqttError, done: Option<oneshot::Sender<()>>) {
        self.session.fail_all(error.clone());
        self.apply_event(ConnectionEvent::Stopped(Some(error)));
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Publish the state implied by `event`; observers see it on arrival
    fn apply_event(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&event, self.config.reconnect.enabled);
        let previous = self.state.send_replace(next);
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }

        match &event {
            ConnectionEvent::Connected { session_present } => {
                self.notifier.notify(Notification::Connected {
                    session_present: *session_present,
                });
            }
            ConnectionEvent::ConnectionLost(error) => {
                self.notifier
                    .notify(Notification::ConnectionLost(error.clone()));
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.notifier.notify(Notification::Reconnecting {
                    attempt: *attempt,
                    delay: *delay,
                });
            }
            _ => {}
        }
    }
}

fn accept(result: MqttResult<(u16, Packet)>, accepted: oneshot::Sender<MqttResult<u16>>) -> Vec<Packet> {
    match result {
        Ok((packet_id, packet)) => {
            let _ = accepted.send(Ok(packet_id));
            vec![packet]
        }
        Err(error) => {
            let _ = accepted.send(Err(error));
            Vec::new()
        }
    }
}

fn send_all(
    connection: &Connection,
    packets: Vec<Packet>,
    keep_alive: &mut KeepAlive,
) -> MqttResult<()> {
    if packets.is_empty() {
        return Ok(());
    }
    for packet in packets {
        connection.send(packet)?;
    }
    keep_alive.record_outbound(Instant::now());
    Ok(())
}
