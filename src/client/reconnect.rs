//! Reconnection backoff configuration

use std::time::Duration;

/// Exponential backoff bounds for the reconnection supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
    /// Ceiling on any single delay
    pub max_interval: Duration,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based)
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_interval`.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_interval.as_secs_f64() {
            return self.max_interval;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<Duration> {
        self.max_attempts
            .map(|max_attempts| (1..=max_attempts).map(|a| self.calculate_backoff_delay(a)).sum())
    }
}
