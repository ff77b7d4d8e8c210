//! mqttsub - MQTT v3.1.1 client session engine
//!
//! The engine keeps one publish/subscribe session alive over an unreliable
//! byte stream: CONNECT/CONNACK, QoS 0/1/2 flows with acknowledgment
//! tracking, keep-alive, reconnection with exponential backoff and
//! clean/persistent session semantics. Message handlers run off the
//! network path, so a slow handler never delays acknowledgments.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqttsub::{ChannelHandler, ClientConfig, MqttClient, QoS, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClientConfig::default();
//! config.broker.server = "tcp://127.0.0.1:1883".to_string();
//!
//! let client = MqttClient::new(config, Arc::new(TcpTransport::new()))?;
//! client.connect().await?;
//!
//! let (handler, mut messages) = ChannelHandler::channel();
//! client.subscribe("sensors/#", QoS::AtLeastOnce, handler).await?.wait().await?;
//!
//! client
//!     .publish("sensors/room1/temp", "21.5", QoS::ExactlyOnce, false)
//!     .await?
//!     .wait()
//!     .await?;
//!
//! if let Some(message) = messages.recv().await {
//!     println!("{}: {:?}", message.topic, message.payload);
//! }
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use client::{
    ChannelHandler, ConnectionObserver, ConnectionState, DeliveryToken, InboundMessage,
    LoggingObserver, MessageHandler, MqttClient, SubscribeToken, SubscriptionResult,
    UnsubscribeToken,
};
pub use config::{ClientConfig, ConfigError};
pub use error::{HandlerError, MqttError, MqttResult};
pub use protocol::{ConnAck, ConnectReturnCode, QoS};
pub use transport::{BrokerAddress, TcpTransport, Transport};
