//! mqttsub - command-line MQTT subscriber
//!
//! Connects to a broker, subscribes to one topic filter on every
//! (re)connect and prints each delivered message until interrupted.

use clap::{Parser, ValueEnum};
use mqttsub::observability::init_default_logging;
use mqttsub::{
    lifecycle_span, ChannelHandler, ClientConfig, ConnectionObserver, ConnectionState,
    HandlerError, InboundMessage, LoggingObserver, MqttClient, MqttError, QoS, TcpTransport,
};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Instrument};

/// Subscribe to an MQTT topic and print received messages
#[derive(Parser)]
#[command(name = "mqttsub")]
#[command(version)]
struct Cli {
    /// Full URL of the broker, e.g. tcp://127.0.0.1:1883
    #[arg(short, long, env = "MQTTSUB_SERVER")]
    server: Option<String>,

    /// Topic filter to subscribe to
    #[arg(short, long)]
    topic: String,

    /// QoS for the subscription (0, 1 or 2)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: Option<u8>,

    /// Client identifier; defaults to the host name plus a random suffix
    #[arg(long)]
    id: Option<String>,

    /// Start a clean session (true/false)
    #[arg(long, action = clap::ArgAction::Set)]
    clean: Option<bool>,

    /// TOML configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format for received messages
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Forwards connects to the main loop so it can resubscribe
struct ResubscribeObserver {
    connected: mpsc::UnboundedSender<bool>,
}

impl ConnectionObserver for ResubscribeObserver {
    fn on_connect(&self, session_present: bool) {
        LoggingObserver.on_connect(session_present);
        let _ = self.connected.send(session_present);
    }

    fn on_connection_lost(&self, error: &MqttError) {
        LoggingObserver.on_connection_lost(error);
    }

    fn on_reconnecting(&self, attempt: u32, delay: Duration) {
        LoggingObserver.on_reconnecting(attempt, delay);
    }

    fn on_handler_error(&self, topic: &str, error: &HandlerError) {
        LoggingObserver.on_handler_error(topic, error);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(2);
        }
    };

    let span = lifecycle_span!(topic = %cli.topic);
    if let Err(e) = run(config, cli.topic, cli.format).instrument(span).await {
        error!("{}", e);
        process::exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        None => ClientConfig::default(),
    };

    if let Some(server) = &cli.server {
        config.broker.server = server.clone();
    }
    if let Some(qos) = cli.qos {
        config.session.qos = qos;
    }
    if let Some(id) = &cli.id {
        config.session.client_id = id.clone();
    }
    if let Some(clean) = cli.clean {
        config.session.clean_session = clean;
    }
    mqttsub::protocol::validate_topic_filter(&cli.topic)?;
    config.validate()?;
    Ok(config)
}

async fn run(
    config: ClientConfig,
    topic: String,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = config.default_qos();
    let server = config.broker.server.clone();
    let client = MqttClient::new(config, Arc::new(TcpTransport::new()))?;
    info!("clientID: {}", client.client_id());
    info!("connecting: {}", server);

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    client
        .set_observer(Arc::new(ResubscribeObserver {
            connected: connected_tx,
        }))
        .await;

    let (handler, mut messages) = ChannelHandler::channel();
    let mut states = client.state_changes();

    client.connect().await?;
    info!("connect success: {}", server);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut subscribed = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, disconnecting");
                break;
            }
            Some(session_present) = connected_rx.recv() => {
                if !needs_subscribe(session_present, subscribed) {
                    info!("broker kept the subscription to {}", topic);
                    continue;
                }
                info!("subscribing {} at {} (session present: {})", topic, qos, session_present);
                subscribe(&client, &topic, qos, handler.clone());
                subscribed = true;
            }
            Some(message) = messages.recv() => print_message(&message, format),
            changed = states.changed() => {
                if changed.is_err() || *states.borrow() == ConnectionState::Disconnected {
                    return Err("session ended: broker unreachable or refused reconnection".into());
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

/// A resumed session keeps the filter; the first connect of this process
/// still subscribes so the handler is registered locally
fn needs_subscribe(session_present: bool, subscribed: bool) -> bool {
    !(session_present && subscribed)
}

fn subscribe(client: &MqttClient, topic: &str, qos: QoS, handler: ChannelHandler) {
    // Waiting happens off the main loop so messages keep printing
    let client = client.clone();
    let topic = topic.to_string();
    tokio::spawn(async move {
        let token = match client.subscribe(&topic, qos, handler).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Subscribe to {} failed: {}", topic, e);
                return;
            }
        };
        match token.wait().await {
            Ok(results) => {
                for result in results {
                    match result.granted() {
                        Some(granted) => info!("subscribed {} at {}", result.filter, granted),
                        None => warn!("broker refused subscription to {}", result.filter),
                    }
                }
            }
            Err(e) => warn!("Subscribe to {} not acknowledged: {}", topic, e),
        }
    });
}

fn print_message(message: &InboundMessage, format: OutputFormat) {
    let payload = String::from_utf8_lossy(&message.payload);
    match format {
        OutputFormat::Text => {
            println!("TOPIC: {}", message.topic);
            println!("MSG: {payload}");
            println!("---------------------------------");
        }
        OutputFormat::Json => {
            let line = json!({
                "topic": message.topic,
                "payload": payload,
                "qos": u8::from(message.qos),
                "retain": message.retain,
                "dup": message.dup,
                "packet_id": message.packet_id,
            });
            println!("{line}");
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumed_session_skips_resubscribe() {
        assert!(needs_subscribe(false, false));
        assert!(needs_subscribe(true, false));
        assert!(needs_subscribe(false, true));
        assert!(!needs_subscribe(true, true));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "mqttsub",
            "--server",
            "tcp://broker:1884",
            "--topic",
            "sensors/#",
            "--qos",
            "1",
            "--clean",
            "false",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.broker.server, "tcp://broker:1884");
        assert_eq!(config.default_qos(), QoS::AtLeastOnce);
        assert!(!config.session.clean_session);
    }
}
