//! Application-facing MQTT client
//!
//! [`MqttClient`] is a cheap, cloneable handle. Every operation is sent to
//! the session event loop as a command; nothing here touches session state
//! directly. Operations that wait for the broker return a token whose
//! `wait` resolves on the terminal acknowledgment.

use super::connection::ConnectionState;
use super::dispatcher::{Dispatcher, MessageHandler};
use super::event_loop::{Command, EventLoop};
use super::health_monitor::HealthMonitor;
use super::observer::{ConnectionObserver, LoggingObserver, Notifier};
use super::pending::{Ack, SubscriptionResult};
use super::session::Session;
use crate::config::{generate_client_id, ClientConfig, ConfigError};
use crate::error::{MqttError, MqttResult};
use crate::protocol::{validate_topic_filter, validate_topic_name, ConnAck, Publish, QoS};
use crate::transport::{BrokerAddress, Transport};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info};

const CLIENT_ID_PREFIX: &str = "mqttsub";

/// Host name when the environment provides one
fn client_id_prefix() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| CLIENT_ID_PREFIX.to_string())
}

/// Handle to one MQTT session
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    client_id: String,
    address: BrokerAddress,
    transport: Arc<dyn Transport>,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    observer: Mutex<Arc<dyn ConnectionObserver>>,
    default_handler: Mutex<Option<Arc<dyn MessageHandler>>>,
}

impl MqttClient {
    /// Create a client; an empty client id is replaced by a random one
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::with_rng(config, transport, &mut StdRng::from_entropy())
    }

    /// Create a client drawing any generated client id from `rng`
    pub fn with_rng<R: Rng + ?Sized>(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let address = BrokerAddress::parse(&config.broker.server)?;

        let client_id = if config.session.client_id.is_empty() {
            generate_client_id(&client_id_prefix(), rng)
        } else {
            config.session.client_id.clone()
        };

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let observer: Arc<dyn ConnectionObserver> = Arc::new(LoggingObserver);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                client_id,
                address,
                transport,
                state: Arc::new(state),
                commands: Mutex::new(None),
                observer: Mutex::new(observer),
                default_handler: Mutex::new(None),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Observer for the next `connect`
    pub async fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.inner.observer.lock().await = observer;
    }

    /// Handler for messages no subscription filter matches
    pub async fn set_default_handler<H: MessageHandler + 'static>(&self, handler: H) {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        *self.inner.default_handler.lock().await = Some(handler.clone());
        // Not running yet is fine: connect picks the stored handler up
        let _ = self
            .send_command(Command::SetDefaultHandler(Some(handler)))
            .await;
    }

    /// Open the connection and complete the CONNECT/CONNACK handshake
    ///
    /// Valid only while `Disconnected`. A refused or failed first connect
    /// is returned to the caller and not retried.
    pub async fn connect(&self) -> MqttResult<ConnAck> {
        let connected = {
            let mut commands = self.inner.commands.lock().await;
            let state = self.state();
            if !HealthMonitor::can_connect(&state) {
                return Err(MqttError::InvalidState { state });
            }
            self.inner.state.send_replace(ConnectionState::Connecting);

            let notifier = Notifier::spawn(self.inner.observer.lock().await.clone());
            let dispatcher = match Dispatcher::spawn(notifier.clone()) {
                Ok(dispatcher) => dispatcher,
                Err(e) => {
                    self.inner.state.send_replace(ConnectionState::Disconnected);
                    return Err(MqttError::connection_unavailable(format!(
                        "cannot start dispatch worker: {e}"
                    )));
                }
            };
            let mut session = Session::new(self.inner.config.session.clean_session, dispatcher);
            session.set_default_handler(self.inner.default_handler.lock().await.clone());

            let (command_tx, command_rx) = mpsc::unbounded_channel();
            *commands = Some(command_tx);

            info!(
                "Connecting to {} as {}",
                self.inner.address, self.inner.client_id
            );
            let (connected_tx, connected_rx) = oneshot::channel();
            EventLoop::new(
                self.inner.config.clone(),
                self.inner.client_id.clone(),
                self.inner.address.clone(),
                self.inner.transport.clone(),
                session,
                command_rx,
                self.inner.state.clone(),
                notifier,
            )
            .spawn(connected_tx);
            connected_rx
        };

        connected.await.map_err(|_| MqttError::ClientStopped)?
    }

    /// Subscribe to one filter
    pub async fn subscribe<H: MessageHandler + 'static>(
        &self,
        filter: &str,
        qos: QoS,
        handler: H,
    ) -> MqttResult<SubscribeToken> {
        self.subscribe_many(vec![(filter.to_string(), qos)], handler)
            .await
    }

    /// Subscribe to several filters in one SUBSCRIBE, sharing one handler
    ///
    /// The token resolves with a result per filter; a refused filter does
    /// not fail the others.
    pub async fn subscribe_many<H: MessageHandler + 'static>(
        &self,
        filters: Vec<(String, QoS)>,
        handler: H,
    ) -> MqttResult<SubscribeToken> {
        if filters.is_empty() {
            return Err(MqttError::protocol_violation(
                "SUBSCRIBE needs at least one filter",
            ));
        }
        for (filter, _) in &filters {
            validate_topic_filter(filter)?;
        }
        self.require(HealthMonitor::can_subscribe)?;

        let (completion, rx) = oneshot::channel();
        let (accepted, accepted_rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            filters,
            handler: Some(Arc::new(handler)),
            completion,
            accepted,
        })
        .await?;
        let packet_id = accepted_rx.await.map_err(|_| MqttError::ClientStopped)??;

        Ok(SubscribeToken(self.token(Some(packet_id), rx).await))
    }

    pub async fn unsubscribe(&self, filter: &str) -> MqttResult<UnsubscribeToken> {
        self.unsubscribe_many(vec![filter.to_string()]).await
    }

    pub async fn unsubscribe_many(&self, filters: Vec<String>) -> MqttResult<UnsubscribeToken> {
        if filters.is_empty() {
            return Err(MqttError::protocol_violation(
                "UNSUBSCRIBE needs at least one filter",
            ));
        }
        for filter in &filters {
            validate_topic_filter(filter)?;
        }
        self.require(HealthMonitor::can_subscribe)?;

        let (completion, rx) = oneshot::channel();
        let (accepted, accepted_rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            filters,
            completion,
            accepted,
        })
        .await?;
        let packet_id = accepted_rx.await.map_err(|_| MqttError::ClientStopped)??;

        Ok(UnsubscribeToken(self.token(Some(packet_id), rx).await))
    }

    /// Publish a message
    ///
    /// Accepted while connected, and queued while reconnecting. QoS 0
    /// tokens resolve once the message is handed to the writer.
    ///
    /// ```
    /// use mqttsub::{ClientConfig, ConnectionState, MqttClient, MqttError, QoS, TcpTransport};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let client = MqttClient::new(ClientConfig::default(), Arc::new(TcpTransport::new()))?;
    ///
    /// let result = client.publish("sensors/room1", "21.5", QoS::AtLeastOnce, false).await;
    /// assert!(matches!(
    ///     result,
    ///     Err(MqttError::NotConnected { state: ConnectionState::Disconnected })
    /// ));
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// # }).unwrap();
    /// ```
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<DeliveryToken> {
        validate_topic_name(topic)?;
        self.require(HealthMonitor::can_publish)?;

        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;

        let (completion, rx) = oneshot::channel();
        let (accepted, accepted_rx) = oneshot::channel();
        self.send_command(Command::Publish {
            publish,
            completion,
            accepted,
        })
        .await?;
        let packet_id = accepted_rx.await.map_err(|_| MqttError::ClientStopped)??;

        Ok(DeliveryToken(self.token(packet_id, rx).await))
    }

    /// Send DISCONNECT, close the transport and cancel everything pending
    ///
    /// Idempotent; returns once the session has stopped.
    pub async fn disconnect(&self) -> MqttResult<()> {
        let sender = self.inner.commands.lock().await.take();
        let Some(sender) = sender else {
            debug!("Disconnect requested while not running");
            return Ok(());
        };

        let (done, done_rx) = oneshot::channel();
        if sender.send(Command::Disconnect { done }).is_ok() {
            // The loop may already have stopped on its own
            let _ = done_rx.await;
        }
        Ok(())
    }

    fn require(&self, allowed: fn(&ConnectionState) -> bool) -> MqttResult<()> {
        let state = self.state();
        if allowed(&state) {
            Ok(())
        } else {
            Err(MqttError::NotConnected { state })
        }
    }

    async fn send_command(&self, command: Command) -> MqttResult<()> {
        self.inner
            .commands
            .lock()
            .await
            .as_ref()
            .ok_or(MqttError::ClientStopped)?
            .send(command)
            .map_err(|_| MqttError::ClientStopped)
    }

    async fn token(&self, packet_id: Option<u16>, rx: oneshot::Receiver<MqttResult<Ack>>) -> Token {
        Token {
            packet_id,
            rx,
            commands: self.inner.commands.lock().await.clone(),
        }
    }
}

struct Token {
    packet_id: Option<u16>,
    rx: oneshot::Receiver<MqttResult<Ack>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl Token {
    async fn wait(self, timeout: Option<Duration>) -> MqttResult<Ack> {
        let Some(timeout) = timeout else {
            return self.rx.await.map_err(|_| MqttError::SessionLost)?;
        };

        match tokio::time::timeout(timeout, self.rx).await {
            Ok(result) => result.map_err(|_| MqttError::SessionLost)?,
            Err(_) => {
                if let (Some(packet_id), Some(commands)) = (self.packet_id, &self.commands) {
                    let _ = commands.send(Command::Abandon { packet_id });
                }
                Err(MqttError::Cancelled)
            }
        }
    }
}

/// Completion of a PUBLISH
pub struct DeliveryToken(Token);

impl DeliveryToken {
    /// Packet identifier for QoS 1 and 2
    pub fn packet_id(&self) -> Option<u16> {
        self.0.packet_id
    }

    /// Wait for PUBACK (QoS 1), PUBCOMP (QoS 2) or the write (QoS 0)
    pub async fn wait(self) -> MqttResult<()> {
        self.0.wait(None).await.map(|_| ())
    }

    /// Like [`wait`](Self::wait), abandoning the operation on timeout
    pub async fn wait_timeout(self, timeout: Duration) -> MqttResult<()> {
        self.0.wait(Some(timeout)).await.map(|_| ())
    }
}

/// Completion of a SUBSCRIBE
pub struct SubscribeToken(Token);

impl SubscribeToken {
    pub fn packet_id(&self) -> Option<u16> {
        self.0.packet_id
    }

    /// Per-filter grant or refusal from the SUBACK
    pub async fn wait(self) -> MqttResult<Vec<SubscriptionResult>> {
        subscription_results(self.0.wait(None).await?)
    }

    pub async fn wait_timeout(self, timeout: Duration) -> MqttResult<Vec<SubscriptionResult>> {
        subscription_results(self.0.wait(Some(timeout)).await?)
    }
}

fn subscription_results(ack: Ack) -> MqttResult<Vec<SubscriptionResult>> {
    match ack {
        Ack::Subscribed(results) => Ok(results),
        other => Err(MqttError::protocol_violation(format!(
            "SUBSCRIBE completed with {other:?}"
        ))),
    }
}

/// Completion of an UNSUBSCRIBE
pub struct UnsubscribeToken(Token);

impl UnsubscribeToken {
    pub fn packet_id(&self) -> Option<u16> {
        self.0.packet_id
    }

    pub async fn wait(self) -> MqttResult<()> {
        self.0.wait(None).await.map(|_| ())
    }

    pub async fn wait_timeout(self, timeout: Duration) -> MqttResult<()> {
        self.0.wait(Some(timeout)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::dispatcher::ChannelHandler;
    use crate::transport::TcpTransport;

    fn client(config: ClientConfig) -> MqttClient {
        MqttClient::with_rng(
            config,
            Arc::new(TcpTransport::new()),
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap()
    }

    #[test]
    fn test_generated_client_id_from_seeded_rng() {
        let first = client(ClientConfig::default());
        let second = client(ClientConfig::default());
        assert_eq!(first.client_id(), second.client_id());
        assert!(first.client_id().starts_with(&format!("{}|", client_id_prefix())));

        let mut config = ClientConfig::default();
        config.session.client_id = "fixed".to_string();
        assert_eq!(client(config).client_id(), "fixed");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ClientConfig::default();
        config.broker.server = "ftp://nowhere".to_string();
        let result = MqttClient::new(config, Arc::new(TcpTransport::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let client = client(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let result = client.publish("a/b", "x", QoS::AtLeastOnce, false).await;
        assert!(matches!(
            result.err(),
            Some(MqttError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));

        let (handler, _rx) = ChannelHandler::channel();
        let result = client.subscribe("a/#", QoS::AtMostOnce, handler).await;
        assert!(matches!(result.err(), Some(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_invalid_topics_rejected_before_state_check() {
        let client = client(ClientConfig::default());

        let result = client.publish("a/+", "x", QoS::AtMostOnce, false).await;
        assert!(matches!(result.err(), Some(MqttError::InvalidTopic(_))));

        let (handler, _rx) = ChannelHandler::channel();
        let result = client.subscribe("a/#/b", QoS::AtMostOnce, handler).await;
        assert!(matches!(result.err(), Some(MqttError::InvalidTopic(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let client = client(ClientConfig::default());
        assert!(client.disconnect().await.is_ok());
        assert!(client.disconnect().await.is_ok());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
