//! MQTT client session engine
//!
//! [`MqttClient`] is the application handle. Behind it a single event-loop
//! task owns the [`Session`]: packet identifiers, in-flight QoS flows,
//! subscriptions and the offline queue. Message handlers run on a separate
//! dispatch worker.

pub mod client;
pub mod connection;
pub mod dispatcher;
pub(crate) mod event_loop;
pub mod health_monitor;
pub mod keepalive;
pub(crate) mod network;
pub mod observer;
pub mod pending;
pub mod reconnect;
pub mod session;

pub use client::{DeliveryToken, MqttClient, SubscribeToken, UnsubscribeToken};
pub use connection::ConnectionState;
pub use dispatcher::{ChannelHandler, Dispatcher, InboundMessage, MessageHandler};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use observer::{ConnectionObserver, LoggingObserver};
pub use pending::SubscriptionResult;
pub use reconnect::ReconnectConfig;
pub use session::Session;
