//! Connection observer hooks
//!
//! Observers are invoked from a dedicated notifier task, never from the
//! session event loop, so a slow observer cannot delay acknowledgments or
//! keep-alive traffic.

use crate::error::{HandlerError, MqttError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Application callbacks for connection lifecycle events
///
/// All methods default to doing nothing.
pub trait ConnectionObserver: Send + Sync {
    /// CONNACK accepted; resubscribe here when using clean sessions
    fn on_connect(&self, _session_present: bool) {}

    /// The connection ended without a disconnect request
    fn on_connection_lost(&self, _error: &MqttError) {}

    /// Backoff started before reconnection attempt `attempt`
    fn on_reconnecting(&self, _attempt: u32, _delay: Duration) {}

    /// A message handler returned an error or panicked
    fn on_handler_error(&self, _topic: &str, _error: &HandlerError) {}
}

/// Observer that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_connect(&self, session_present: bool) {
        info!("Connected to broker (session present: {})", session_present);
    }

    fn on_connection_lost(&self, error: &MqttError) {
        error!("Connection lost: {}", error);
    }

    fn on_reconnecting(&self, attempt: u32, delay: Duration) {
        info!("Reconnecting (attempt {}) in {:?}", attempt, delay);
    }

    fn on_handler_error(&self, topic: &str, error: &HandlerError) {
        warn!("Handler for '{}' failed: {}", topic, error);
    }
}

pub(crate) enum Notification {
    Connected { session_present: bool },
    ConnectionLost(MqttError),
    Reconnecting { attempt: u32, delay: Duration },
    HandlerError { topic: String, error: HandlerError },
}

/// Sending half of the notification path
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Spawn the notifier task delivering to `observer`
    pub(crate) fn spawn(observer: Arc<dyn ConnectionObserver>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                match notification {
                    Notification::Connected { session_present } => {
                        observer.on_connect(session_present)
                    }
                    Notification::ConnectionLost(error) => observer.on_connection_lost(&error),
                    Notification::Reconnecting { attempt, delay } => {
                        observer.on_reconnecting(attempt, delay)
                    }
                    Notification::HandlerError { topic, error } => {
                        observer.on_handler_error(&topic, &error)
                    }
                }
            }
        });
        Self { tx }
    }

    /// Never blocks; notifications after the task ends are dropped
    pub(crate) fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}
