//! Keep-alive timer
//!
//! Pure bookkeeping: the event loop feeds it outbound activity and PINGRESPs
//! and sleeps until [`KeepAlive::next_deadline`]. Uses `tokio::time::Instant`
//! so tests can drive it with a paused clock.

use std::time::Duration;
use tokio::time::Instant;

/// What the event loop must do when a keep-alive deadline fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Deadline not reached yet
    Wait,
    /// Nothing was written for a full interval
    SendPing,
    /// PINGREQ outstanding past the ping timeout
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    ping_timeout: Duration,
    last_outbound: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// A zero `interval` disables pings entirely
    pub fn new(interval: Duration, ping_timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            ping_timeout,
            last_outbound: now,
            ping_sent_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn record_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.last_outbound = now;
        self.ping_sent_at = Some(now);
    }

    /// Returns false for a PINGRESP nobody asked for
    pub fn record_pong(&mut self) -> bool {
        self.ping_sent_at.take().is_some()
    }

    pub fn awaiting_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        Some(match self.ping_sent_at {
            Some(sent_at) => sent_at + self.ping_timeout,
            None => self.last_outbound + self.interval,
        })
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        match self.next_deadline() {
            Some(deadline) if now >= deadline => {
                if self.awaiting_pong() {
                    KeepAliveAction::TimedOut
                } else {
                    KeepAliveAction::SendPing
                }
            }
            _ => KeepAliveAction::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(start: Instant) -> KeepAlive {
        KeepAlive::new(Duration::from_secs(10), Duration::from_secs(1), start)
    }

    #[test]
    fn test_ping_due_after_idle_interval() {
        let start = Instant::now();
        let keep_alive = timer(start);

        assert_eq!(keep_alive.poll(start + Duration::from_secs(9)), KeepAliveAction::Wait);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(10)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_outbound_traffic_postpones_ping() {
        let start = Instant::now();
        let mut keep_alive = timer(start);

        keep_alive.record_outbound(start + Duration::from_secs(8));
        assert_eq!(keep_alive.poll(start + Duration::from_secs(10)), KeepAliveAction::Wait);
        assert_eq!(
            keep_alive.next_deadline(),
            Some(start + Duration::from_secs(18))
        );
    }

    #[test]
    fn test_missing_pong_times_out() {
        let start = Instant::now();
        let mut keep_alive = timer(start);

        let sent = start + Duration::from_secs(10);
        keep_alive.ping_sent(sent);
        assert!(keep_alive.awaiting_pong());
        assert_eq!(keep_alive.next_deadline(), Some(sent + Duration::from_secs(1)));
        assert_eq!(keep_alive.poll(sent + Duration::from_millis(999)), KeepAliveAction::Wait);
        assert_eq!(
            keep_alive.poll(sent + Duration::from_secs(1)),
            KeepAliveAction::TimedOut
        );
    }

    #[test]
    fn test_pong_clears_outstanding_ping() {
        let start = Instant::now();
        let mut keep_alive = timer(start);

        keep_alive.ping_sent(start);
        assert!(keep_alive.record_pong());
        assert!(!keep_alive.record_pong());
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(5)),
            KeepAliveAction::Wait
        );
    }

    #[test]
    fn test_zero_interval_disables_timer() {
        let start = Instant::now();
        let keep_alive = KeepAlive::new(Duration::ZERO, Duration::from_secs(1), start);

        assert!(!keep_alive.is_enabled());
        assert_eq!(keep_alive.next_deadline(), None);
        assert_eq!(
            keep_alive.poll(start + Duration::from_secs(3600)),
            KeepAliveAction::Wait
        );
    }
}
