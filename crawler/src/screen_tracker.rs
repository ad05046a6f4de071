//! Screen deduplication and per-run visit bookkeeping.
//!
//! Each captured screenshot is fingerprinted and resolved to a stored screen:
//! exact fingerprint first, then the closest stored fingerprint within
//! [`MAX_MATCH_DISTANCE`] bits, else a new screen is created for the current
//! run and step. Stored screens outlive runs, so a later run recognizes screens
//! an earlier run discovered; visit counts and transitions are per run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::fingerprint::MAX_MATCH_DISTANCE;
use crate::core::types::{NewScreen, Screen, ScreenId, ScreenObservation};
use crate::io::fingerprint::Fingerprinter;
use crate::io::store::{RepositoryError, ScreenStore, ScreenTransition};

/// How a captured screen was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenMatch {
    Exact,
    Fuzzy { distance: u32 },
    New,
}

pub struct ScreenTracker {
    fingerprinter: Arc<dyn Fingerprinter>,
    store: Arc<dyn ScreenStore>,
    run_id: Option<String>,
    visit_counts: HashMap<ScreenId, u32>,
    discovered: HashSet<ScreenId>,
    previous: Option<ScreenId>,
    consecutive: u32,
    new_screens: u32,
    last_match: Option<ScreenMatch>,
}

impl ScreenTracker {
    pub fn new(fingerprinter: Arc<dyn Fingerprinter>, store: Arc<dyn ScreenStore>) -> Self {
        Self {
            fingerprinter,
            store,
            run_id: None,
            visit_counts: HashMap::new(),
            discovered: HashSet::new(),
            previous: None,
            consecutive: 0,
            new_screens: 0,
            last_match: None,
        }
    }

    pub fn start_run(&mut self, run_id: &str) {
        self.clear();
        self.run_id = Some(run_id.to_string());
        debug!(run_id, "screen tracking started");
    }

    pub fn end_run(&mut self) {
        if let Some(run_id) = &self.run_id {
            let visits: u32 = self.visit_counts.values().sum();
            info!(
                run_id = %run_id,
                distinct_screens = self.discovered.len(),
                new_screens = self.new_screens,
                visits,
                "screen tracking finished"
            );
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.run_id = None;
        self.visit_counts.clear();
        self.discovered.clear();
        self.previous = None;
        self.consecutive = 0;
        self.new_screens = 0;
        self.last_match = None;
    }

    /// Resolve a screenshot to a screen and update the run's bookkeeping.
    #[instrument(skip_all, fields(step = step))]
    pub fn process_screen(
        &mut self,
        png: &[u8],
        activity: Option<&str>,
        step: u32,
        screenshot_path: Option<&Path>,
    ) -> Result<ScreenObservation> {
        let run_id = self
            .run_id
            .clone()
            .ok_or_else(|| anyhow!("process_screen called outside a run"))?;
        let fingerprint = self
            .fingerprinter
            .fingerprint(png)
            .context("fingerprint screenshot")?;

        let (screen, matched) =
            self.resolve(&fingerprint, &run_id, activity, step, screenshot_path)?;
        debug!(screen_id = screen.id, ?matched, %fingerprint, "screen resolved");

        let is_new = matched == ScreenMatch::New;
        if is_new {
            self.new_screens += 1;
        }
        self.discovered.insert(screen.id);
        let visit_count = {
            let count = self.visit_counts.entry(screen.id).or_insert(0);
            *count += 1;
            *count
        };

        match self.previous {
            Some(previous) if previous == screen.id => self.consecutive += 1,
            Some(previous) => {
                self.store
                    .record_transition(&ScreenTransition {
                        run_id: run_id.clone(),
                        from: previous,
                        to: screen.id,
                        step,
                    })
                    .context(RepositoryError::new("record screen transition"))?;
                self.consecutive = 1;
            }
            None => self.consecutive = 1,
        }
        self.previous = Some(screen.id);
        self.last_match = Some(matched);

        Ok(ScreenObservation {
            screen_id: screen.id,
            is_new,
            visit_count,
            total_screens: u32::try_from(self.discovered.len()).unwrap_or(u32::MAX),
        })
    }

    fn resolve(
        &self,
        fingerprint: &str,
        run_id: &str,
        activity: Option<&str>,
        step: u32,
        screenshot_path: Option<&Path>,
    ) -> Result<(Screen, ScreenMatch)> {
        if let Some(screen) = self
            .store
            .find_by_fingerprint(fingerprint)
            .context(RepositoryError::new("exact screen lookup"))?
        {
            return Ok((screen, ScreenMatch::Exact));
        }
        if let Some((screen, distance)) = self
            .store
            .find_similar(fingerprint, MAX_MATCH_DISTANCE)
            .context(RepositoryError::new("fuzzy screen lookup"))?
        {
            return Ok((screen, ScreenMatch::Fuzzy { distance }));
        }
        let screen = self
            .store
            .create_screen(NewScreen {
                fingerprint: fingerprint.to_string(),
                screenshot_path: screenshot_path.map(|p| p.display().to_string()),
                activity: activity.map(str::to_string),
                first_seen_run: run_id.to_string(),
                first_seen_step: step,
            })
            .context(RepositoryError::new("create screen"))?;
        Ok((screen, ScreenMatch::New))
    }

    /// True when the current screen has recurred at least `threshold` times
    /// in a row in this run.
    pub fn is_stuck(&self, threshold: u32) -> bool {
        self.previous.is_some() && self.consecutive >= threshold
    }

    pub fn current_screen(&self) -> Option<ScreenId> {
        self.previous
    }

    pub fn last_match(&self) -> Option<ScreenMatch> {
        self.last_match
    }

    pub fn visit_count(&self, screen: ScreenId) -> u32 {
        self.visit_counts.get(&screen).copied().unwrap_or(0)
    }

    pub fn distinct_screens(&self) -> usize {
        self.discovered.len()
    }

    pub fn new_screens(&self) -> u32 {
        self.new_screens
    }
}
