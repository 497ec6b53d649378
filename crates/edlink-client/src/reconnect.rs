//! Reconnection policy: fixed delay, bounded attempts.

use std::time::Duration;

use crate::close::CloseCode;

/// Outcome of consulting the policy after a close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The close was intentional; do nothing.
    Stop,
    /// Schedule attempt number `attempt` (1-based) after `delay`.
    Retry {
        /// The counter value after this retry is scheduled.
        attempt: u32,
        /// How long to wait before reconnecting.
        delay: Duration,
    },
    /// The attempt ceiling is reached.
    GiveUp {
        /// The counter value to keep while given up.
        attempts: u32,
    },
}

/// Decides whether and when to reconnect after the connection is lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl ReconnectPolicy {
    /// Policy allowing `max_attempts` retries, each after `delay`.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Retry only for an unintentional close while under the ceiling.
    ///
    /// `attempt_count` is the number of consecutive unexpected closes,
    /// this one included, since the last successful connection.
    #[must_use]
    pub fn should_retry(&self, attempt_count: u32, close_was_intentional: bool) -> bool {
        !close_was_intentional && attempt_count < self.max_attempts
    }

    /// Fixed delay before each attempt.
    #[must_use]
    pub fn delay_before_next_attempt(&self) -> Duration {
        self.delay
    }

    /// Classify a close given how many retries have already been scheduled
    /// since the last successful connection.
    ///
    /// The close that brings the counter to the ceiling gives up, so with a
    /// ceiling of `n` the `n`-th consecutive unexpected close is final.
    #[must_use]
    pub fn decide(&self, attempt_count: u32, code: CloseCode) -> ReconnectDecision {
        if code.is_intentional() {
            return ReconnectDecision::Stop;
        }
        let closes = attempt_count.saturating_add(1);
        if self.should_retry(closes, false) {
            ReconnectDecision::Retry {
                attempt: closes,
                delay: self.delay,
            }
        } else {
            ReconnectDecision::GiveUp {
                attempts: closes.min(self.max_attempts),
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}
