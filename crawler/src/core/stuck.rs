//! Consecutive-visit counting for stuck detection.
//!
//! The detector only counts: it knows nothing about why a screen recurs.

use std::collections::HashMap;

use crate::core::types::ScreenId;

pub const DEFAULT_STUCK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct StuckDetector {
    threshold: u32,
    counts: HashMap<ScreenId, u32>,
    current: Option<ScreenId>,
    stuck_reason: Option<String>,
    recoveries_succeeded: u32,
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STUCK_THRESHOLD)
    }
}

impl StuckDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: HashMap::new(),
            current: None,
            stuck_reason: None,
            recoveries_succeeded: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a visit and return whether the detector is now stuck.
    pub fn record_screen_visit(&mut self, screen_id: ScreenId) -> bool {
        if let Some(previous) = self.current
            && previous != screen_id
        {
            self.counts.insert(previous, 0);
        }
        self.current = Some(screen_id);

        let count = self.counts.entry(screen_id).or_insert(0);
        *count += 1;
        let count = *count;

        if count > self.threshold {
            self.stuck_reason = Some(format!(
                "screen {screen_id} visited {count} times in a row (threshold {})",
                self.threshold
            ));
        } else {
            self.stuck_reason = None;
        }
        self.is_stuck()
    }

    pub fn record_recovery(&mut self, success: bool) {
        self.stuck_reason = None;
        if let Some(current) = self.current {
            self.counts.insert(current, 0);
        }
        if success {
            self.recoveries_succeeded += 1;
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck_reason.is_some()
    }

    pub fn stuck_reason(&self) -> Option<&str> {
        self.stuck_reason.as_deref()
    }

    pub fn consecutive_visits(&self, screen_id: ScreenId) -> u32 {
        self.counts.get(&screen_id).copied().unwrap_or(0)
    }

    pub fn current_screen(&self) -> Option<ScreenId> {
        self.current
    }

    pub fn recoveries_succeeded(&self) -> u32 {
        self.recoveries_succeeded
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.current = None;
        self.stuck_reason = None;
        self.recoveries_succeeded = 0;
    }
}
