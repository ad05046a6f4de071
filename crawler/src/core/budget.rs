//! Pause-aware time budget for a crawl run.

use std::time::{Duration, Instant};

/// Wall-clock run timer that excludes time spent paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunClock {
    started_at: Instant,
    paused_total: Duration,
    paused_since: Option<Instant>,
}

impl RunClock {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            paused_total: Duration::ZERO,
            paused_since: None,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn begin_pause(&mut self, now: Instant) {
        if self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    pub fn end_pause(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    pub fn add_paused(&mut self, paused: Duration) {
        self.paused_total += paused;
    }

    /// Accumulated paused time, including an ongoing pause.
    pub fn paused(&self, now: Instant) -> Duration {
        let ongoing = self
            .paused_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);
        self.paused_total + ongoing
    }

    /// `now - start - paused`.
    pub fn active_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
            .saturating_sub(self.paused(now))
    }

    /// `None` limit means unlimited.
    pub fn within_limit(&self, limit: Option<Duration>, now: Instant) -> bool {
        match limit {
            Some(limit) => self.active_elapsed(now) < limit,
            None => true,
        }
    }

    pub fn remaining(&self, limit: Duration, now: Instant) -> Duration {
        limit.saturating_sub(self.active_elapsed(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_limit_subtracts_paused_time() {
        let start = Instant::now();
        let limit = Duration::from_secs(60);
        let now = start + Duration::from_secs(70);

        let mut clock = RunClock::new(start);
        assert!(!clock.within_limit(Some(limit), now));

        clock.add_paused(Duration::from_secs(10));
        // 70 - 10 = 60, not strictly below the limit.
        assert!(!clock.within_limit(Some(limit), now));

        clock.add_paused(Duration::from_secs(1));
        assert!(clock.within_limit(Some(limit), now));
        assert_eq!(clock.remaining(limit, now), Duration::from_secs(1));
    }

    #[test]
    fn paused_time_extends_availability_exactly() {
        let start = Instant::now();
        let limit = Duration::from_secs(30);
        for paused_secs in [0u64, 5, 17, 120] {
            let mut clock = RunClock::new(start);
            clock.add_paused(Duration::from_secs(paused_secs));
            let last_ok = start + Duration::from_secs(29 + paused_secs);
            let first_out = start + Duration::from_secs(30 + paused_secs);
            assert!(clock.within_limit(Some(limit), last_ok));
            assert!(!clock.within_limit(Some(limit), first_out));
        }
    }

    #[test]
    fn ongoing_pause_counts_until_ended() {
        let start = Instant::now();
        let mut clock = RunClock::new(start);
        clock.begin_pause(start + Duration::from_secs(5));
        let during = start + Duration::from_secs(20);
        assert_eq!(clock.active_elapsed(during), Duration::from_secs(5));

        clock.end_pause(start + Duration::from_secs(25));
        let after = start + Duration::from_secs(30);
        assert_eq!(clock.paused(after), Duration::from_secs(20));
        assert_eq!(clock.active_elapsed(after), Duration::from_secs(10));
    }

    #[test]
    fn no_limit_is_always_within() {
        let start = Instant::now();
        let clock = RunClock::new(start);
        assert!(clock.within_limit(None, start + Duration::from_secs(86_400)));
    }
}
