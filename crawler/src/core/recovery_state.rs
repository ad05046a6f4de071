//! Bounded-retry bookkeeping for session recovery within one step.

use std::time::{Duration, Instant};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub max_attempts: u32,
    pub delay: Duration,
    attempts: u32,
    last_attempt_at: Option<Instant>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RECOVERY_DELAY)
    }
}

impl RecoveryState {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
            last_attempt_at: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }

    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Record an attempt and return its 1-based number.
    ///
    /// The counter saturates at `max_attempts`.
    pub fn record_attempt(&mut self, at: Instant) -> u32 {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
        }
        self.last_attempt_at = Some(at);
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt_at = None;
    }
}
