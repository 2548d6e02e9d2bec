//! Push-channel liveness tracking.
//!
//! A push channel can stay open while delivering nothing (a stalled proxy, a
//! backend that stopped publishing). The monitor records the last message
//! time so the connection manager can declare the channel degraded and let
//! polling carry the data until messages resume.

use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Floor for the check cadence so tiny stale windows don't spin.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

pub struct LivenessMonitor {
    /// Silence longer than this marks the channel stale (0 = never).
    stale_after_ms: u64,
    last_message: RwLock<Instant>,
    last_ping: RwLock<Option<Instant>>,
}

impl LivenessMonitor {
    pub fn new(stale_after_ms: u64) -> Self {
        Self {
            stale_after_ms,
            last_message: RwLock::new(Instant::now()),
            last_ping: RwLock::new(None),
        }
    }

    /// Reset on (re)connect.
    pub fn reset(&self) {
        *self.last_message.write() = Instant::now();
        *self.last_ping.write() = None;
    }

    pub fn record_message(&self) {
        *self.last_message.write() = Instant::now();
        *self.last_ping.write() = None;
    }

    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Instant::now());
        debug!("Recorded liveness ping");
    }

    pub fn silence(&self) -> Duration {
        self.last_message.read().elapsed()
    }

    pub fn is_enabled(&self) -> bool {
        self.stale_after_ms > 0
    }

    pub fn is_stale(&self) -> bool {
        self.is_enabled() && self.silence() > Duration::from_millis(self.stale_after_ms)
    }

    /// Ping once per silent stretch, after half the stale window.
    pub fn should_ping(&self) -> bool {
        self.is_enabled()
            && self.last_ping.read().is_none()
            && self.silence() >= Duration::from_millis(self.stale_after_ms / 2)
    }

    pub fn check_interval(&self) -> Duration {
        if !self.is_enabled() {
            // Checks are no-ops when disabled; keep the timer slow.
            return Duration::from_secs(3600);
        }
        Duration::from_millis(self.stale_after_ms / 4).max(MIN_CHECK_INTERVAL)
    }

    /// Wait for the next liveness check.
    pub async fn wait_for_check(&self) {
        tokio::time::sleep(self.check_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_not_stale() {
        let monitor = LivenessMonitor::new(10_000);
        assert!(!monitor.is_stale());
        assert!(!monitor.should_ping());
    }

    #[test]
    fn test_becomes_stale_after_silence() {
        let monitor = LivenessMonitor::new(40);
        std::thread::sleep(Duration::from_millis(60));
        assert!(monitor.is_stale());

        monitor.record_message();
        assert!(!monitor.is_stale());
    }

    #[test]
    fn test_ping_once_per_silence() {
        let monitor = LivenessMonitor::new(40);
        std::thread::sleep(Duration::from_millis(25));
        assert!(monitor.should_ping());
        monitor.record_ping();
        assert!(!monitor.should_ping());

        monitor.record_message();
        assert!(!monitor.should_ping());
    }

    #[test]
    fn test_disabled_never_stale() {
        let monitor = LivenessMonitor::new(0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!monitor.is_stale());
        assert!(!monitor.should_ping());
        assert_eq!(monitor.check_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_wait_for_check_sleeps_one_interval() {
        let monitor = LivenessMonitor::new(400);
        let started = std::time::Instant::now();
        tokio_test::block_on(monitor.wait_for_check());
        assert!(started.elapsed() >= monitor.check_interval());
    }
}
