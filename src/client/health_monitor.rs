//! Pure health monitoring and reconnection logic
//!
//! Every function here is side-effect free apart from logging, so the event
//! loop can stay a thin shell around them.

use super::connection::ConnectionState;
use super::reconnect::ReconnectConfig;
use crate::error::MqttError;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: &ConnectionEvent, auto_reconnect: bool) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::Connected { .. } => ConnectionState::Connected,
            ConnectionEvent::ConnectionLost(_) if auto_reconnect => ConnectionState::Reconnecting(1),
            ConnectionEvent::ConnectionLost(_) => ConnectionState::Disconnected,
            ConnectionEvent::Reconnecting { attempt, .. } => ConnectionState::Reconnecting(*attempt),
            ConnectionEvent::DisconnectRequested => ConnectionState::Disconnecting,
            ConnectionEvent::Stopped(_) => ConnectionState::Disconnected,
        }
    }

    /// Publishing is accepted while connected, and queued while reconnecting
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Connected | ConnectionState::Reconnecting(_)
        )
    }

    /// Check if connection state allows subscribing (pure function)
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Check if connection state allows a new connect (pure function)
    pub fn can_connect(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Disconnected)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established successfully");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!("MQTT connection lost, entering reconnection");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Disconnected) => {
                error!("MQTT reconnection stopped");
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }

    /// Validate connection configuration (pure function)
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.multiplier.is_nan() || config.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0".to_string());
        }

        if config.initial_delay > config.max_interval {
            return Err("initial_delay must not exceed max_interval".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport opened, CONNECT on its way
    ConnectStarted,
    /// CONNACK accepted by broker
    Connected { session_present: bool },
    /// Network, protocol or keep-alive failure
    ConnectionLost(MqttError),
    /// Backoff started before the given attempt
    Reconnecting { attempt: u32, delay: Duration },
    /// Application called disconnect
    DisconnectRequested,
    /// Session engine stopped for good
    Stopped(Option<MqttError>),
}
