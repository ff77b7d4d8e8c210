//! Inbound message dispatch
//!
//! The session registers one handler per topic filter. Matching happens on
//! the event loop; handler execution happens on a dedicated worker thread
//! fed by a queue, so a slow, failing or panicking handler never stalls
//! packet processing.

use super::observer::{Notification, Notifier};
use crate::error::HandlerError;
use crate::protocol::{topic_matches, Publish, QoS};
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present for QoS 1 and 2
    pub packet_id: Option<u16>,
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        }
    }
}

/// Application callback for messages matching a topic filter
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Handler that forwards every message into a channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl ChannelHandler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageHandler for ChannelHandler {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self.tx
            .send(message.clone())
            .map_err(|_| HandlerError::from("message receiver dropped"))
    }
}

struct Route {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

struct DispatchJob {
    message: InboundMessage,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

pub struct Dispatcher {
    routes: Vec<Route>,
    default_handler: Option<Arc<dyn MessageHandler>>,
    jobs: mpsc::UnboundedSender<DispatchJob>,
}

impl Dispatcher {
    /// Start the worker thread; it exits when the dispatcher is dropped
    pub(crate) fn spawn(notifier: Notifier) -> std::io::Result<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<DispatchJob>();

        std::thread::Builder::new()
            .name("mqtt-dispatch".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_job(job, &notifier);
                }
                debug!(target: "mqtt_session", "Dispatch worker stopped");
            })?;

        Ok(Self {
            routes: Vec::new(),
            default_handler: None,
            jobs,
        })
    }

    /// Register `handler` for `filter`, replacing any previous one
    pub fn register(&mut self, filter: &str, handler: Arc<dyn MessageHandler>) {
        match self.routes.iter_mut().find(|route| route.filter == filter) {
            Some(route) => route.handler = handler,
            None => self.routes.push(Route {
                filter: filter.to_string(),
                handler,
            }),
        }
    }

    pub fn unregister(&mut self, filter: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|route| route.filter != filter);
        self.routes.len() != before
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn set_default_handler(&mut self, handler: Option<Arc<dyn MessageHandler>>) {
        self.default_handler = handler;
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.filter.as_str())
    }

    /// Every handler whose filter matches `topic`, in registration order
    pub fn matching(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.routes
            .iter()
            .filter(|route| topic_matches(&route.filter, topic))
            .map(|route| route.handler.clone())
            .collect()
    }

    /// Queue `message` for its handlers; returns false if nothing matched
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        let mut handlers = self.matching(&message.topic);
        if handlers.is_empty() {
            match &self.default_handler {
                Some(default) => handlers.push(default.clone()),
                None => {
                    debug!(
                        target: "mqtt_session",
                        "No handler for message on topic: {}", message.topic
                    );
                    return false;
                }
            }
        }

        trace!(
            target: "mqtt_session",
            "Queueing message on {} for {} handler(s)", message.topic, handlers.len()
        );
        if self.jobs.send(DispatchJob { message, handlers }).is_err() {
            warn!("Dispatch worker has stopped; message dropped");
            return false;
        }
        true
    }
}

fn run_job(job: DispatchJob, notifier: &Notifier) {
    for handler in &job.handlers {
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&job.message)));
        let error = match result {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(panic) => {
                HandlerError::from(format!("handler panicked: {}", panic_message(&*panic)))
            }
        };
        notifier.notify(Notification::HandlerError {
            topic: job.message.topic.clone(),
            error,
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
