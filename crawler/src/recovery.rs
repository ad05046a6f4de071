//! Automation-session crash recovery with a per-step attempt budget.
//!
//! The manager never loops on its own: the caller checks
//! [`SessionRecoveryManager::should_retry`], calls
//! [`SessionRecoveryManager::attempt_recovery`] once per attempt and decides
//! what to re-run afterwards.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::classifier;
use crate::core::recovery_state::RecoveryState;
use crate::events::millis;
use crate::io::clock::Clock;
use crate::io::driver::DeviceDriver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    pub success: bool,
    pub attempt_number: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

pub struct SessionRecoveryManager {
    state: RecoveryState,
    clock: Arc<dyn Clock>,
}

impl SessionRecoveryManager {
    pub fn new(max_attempts: u32, delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RecoveryState::new(max_attempts, delay),
            clock,
        }
    }

    /// Whether `error` (rendered with its full context chain) is a session crash.
    pub fn is_crash(&self, error: &str) -> bool {
        classifier::is_crash(error)
    }

    pub fn should_retry(&self) -> bool {
        self.state.should_retry()
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts()
    }

    pub fn max_attempts(&self) -> u32 {
        self.state.max_attempts
    }

    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    /// Record one attempt and restart the driver session once.
    #[instrument(
        skip_all,
        fields(attempt = self.state.attempts() + 1, max = self.state.max_attempts)
    )]
    pub fn attempt_recovery(&mut self, driver: &dyn DeviceDriver) -> RecoveryResult {
        let started = self.clock.now();
        let attempt_number = self.state.record_attempt(started);
        let outcome = driver.restart_session(self.state.delay);
        let duration = self.clock.now().saturating_duration_since(started);
        match outcome {
            Ok(()) => {
                info!(
                    attempt_number,
                    duration_ms = millis(duration),
                    "session restarted"
                );
                RecoveryResult {
                    success: true,
                    attempt_number,
                    duration,
                    error: None,
                }
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(attempt_number, %error, "session restart failed");
                RecoveryResult {
                    success: false,
                    attempt_number,
                    duration,
                    error: Some(error),
                }
            }
        }
    }

    pub fn reset_for_new_step(&mut self) {
        self.state.reset();
    }
}
