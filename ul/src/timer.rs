//! Monotonic expiration timers for the upper layer protocol.
//!
//! The protocol relies on a handful of timers:
//! the ARTIM timer driven by the state machine,
//! plus the ACSE, DIMSE and network inactivity timeouts
//! that bound how long the respective layers wait for the peer.
//! All of them measure elapsed time against the monotonic clock.

use std::time::{Duration, Instant};

/// A two-phase expiration timer.
///
/// A timer is constructed with an optional timeout
/// (`None` meaning that it never expires)
/// and does not count until started.
/// Restarting an already running timer resets its deadline.
#[derive(Debug, Clone)]
pub struct Timer {
    timeout: Option<Duration>,
    started_at: Option<Instant>,
}

impl Timer {
    /// Create a new timer with the given timeout in seconds.
    pub fn new(timeout_seconds: Option<u64>) -> Self {
        Timer {
            timeout: timeout_seconds.map(Duration::from_secs),
            started_at: None,
        }
    }

    /// Create a new timer with the given timeout.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Timer {
            timeout,
            started_at: None,
        }
    }

    /// Start counting down.
    /// Starting a running timer resets its deadline.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop the timer without expiring it.
    pub fn stop(&mut self) {
        self.started_at = None;
    }

    /// Reset the deadline of a running timer.
    pub fn restart(&mut self) {
        self.start();
    }

    /// Whether the timer is currently counting down.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Whether the timer has been running for longer than its timeout.
    ///
    /// A stopped timer, or one without a timeout, never expires.
    pub fn expired(&self) -> bool {
        match (self.started_at, self.timeout) {
            (Some(started_at), Some(timeout)) => started_at.elapsed() >= timeout,
            _ => false,
        }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;
    use std::time::Duration;

    #[test]
    fn stopped_timer_never_expires() {
        let timer = Timer::with_timeout(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!timer.expired());
    }

    #[test]
    fn timer_without_timeout_never_expires() {
        let mut timer = Timer::new(None);
        timer.start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!timer.expired());
    }

    #[test]
    fn started_timer_expires() {
        let mut timer = Timer::with_timeout(Some(Duration::from_millis(2)));
        timer.start();
        assert!(!timer.expired());
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.expired());
    }

    #[test]
    fn restart_resets_the_deadline() {
        let mut timer = Timer::with_timeout(Some(Duration::from_millis(50)));
        timer.start();
        std::thread::sleep(Duration::from_millis(30));
        timer.restart();
        std::thread::sleep(Duration::from_millis(30));
        // 60ms since start, but only 30ms since restart
        assert!(!timer.expired());
    }

    #[test]
    fn stop_cancels_expiration() {
        let mut timer = Timer::with_timeout(Some(Duration::from_millis(2)));
        timer.start();
        timer.stop();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!timer.expired());
    }
}
