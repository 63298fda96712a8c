//! Restart throttling
//!
//! A crash-looping or missing server executable must not trigger a
//! restart storm; the gate tracks the earliest instant another spawn may
//! be attempted, doubling the hold-off on repeated failures and resetting
//! once a session completes its initialize handshake.

use std::time::{Duration, Instant};
use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct RestartGate {
    delay: Duration,
    not_before: Option<Instant>,
}

impl RestartGate {
    pub fn new() -> Self {
        Self {
            delay: INITIAL_DELAY,
            not_before: None,
        }
    }

    /// Remaining hold-off if the gate is currently closed
    pub fn holdoff(&self) -> Option<Duration> {
        let not_before = self.not_before?;
        let now = Instant::now();
        (now < not_before).then(|| not_before - now)
    }

    /// Record a failed session; the next attempt is pushed out and the
    /// hold-off doubles, capped at 30s
    pub fn record_failure(&mut self) {
        self.not_before = Some(Instant::now() + self.delay);
        debug!(delay_ms = self.delay.as_millis(), "restart gate closed");
        self.delay = (self.delay * 2).min(MAX_DELAY);
    }

    /// Forget the failure history after a successful handshake
    pub fn reset(&mut self) {
        self.delay = INITIAL_DELAY;
        self.not_before = None;
    }
}

impl Default for RestartGate {
    fn default() -> Self {
        Self::new()
    }
}
