//! Persistence seams for runs, screens and steps, plus an in-memory store.
//!
//! The database-backed repositories live outside this crate; [`MemoryStore`]
//! implements all three traits for embedding and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::fingerprint::closest_match;
use crate::core::types::{CrawlRun, NewScreen, RunStatus, Screen, ScreenId, StepRecord};

/// Context marker for store failures; callers find it with
/// `anyhow::Error::downcast_ref` to tell persistence failures apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} failed")]
pub struct RepositoryError {
    pub operation: &'static str,
}

impl RepositoryError {
    pub fn new(operation: &'static str) -> Self {
        Self { operation }
    }

    pub fn is_repository_failure(err: &anyhow::Error) -> bool {
        err.downcast_ref::<RepositoryError>().is_some()
    }
}

pub trait RunStore: Send + Sync {
    fn get_run(&self, run_id: &str) -> Result<CrawlRun>;
    fn mark_running(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<()>;
    fn update_progress(&self, run_id: &str, step_count: u32, screen_count: u32) -> Result<()>;
    fn finish_run(&self, run_id: &str, status: RunStatus, ended_at: DateTime<Utc>) -> Result<()>;
}

pub trait ScreenStore: Send + Sync {
    fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Screen>>;

    /// Closest stored screen within `max_distance` bits, with its distance.
    fn find_similar(&self, fingerprint: &str, max_distance: u32) -> Result<Option<(Screen, u32)>>;

    fn create_screen(&self, screen: NewScreen) -> Result<Screen>;

    fn record_transition(&self, transition: &ScreenTransition) -> Result<()>;
}

pub trait StepStore: Send + Sync {
    fn record_step(&self, record: &StepRecord) -> Result<()>;
}

/// Directed edge between two screens observed in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenTransition {
    pub run_id: String,
    pub from: ScreenId,
    pub to: ScreenId,
    pub step: u32,
}

#[derive(Debug, Default)]
struct Tables {
    runs: BTreeMap<String, CrawlRun>,
    screens: BTreeMap<ScreenId, Screen>,
    transitions: Vec<ScreenTransition>,
    steps: Vec<StepRecord>,
    next_screen_id: ScreenId,
}

/// Thread-safe in-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Register a run; runs are created outside the crawl loop.
    pub fn insert_run(&self, run: CrawlRun) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.runs.contains_key(&run.id) {
            return Err(anyhow!("run {} already exists", run.id));
        }
        tables.runs.insert(run.id.clone(), run);
        Ok(())
    }

    pub fn screens(&self) -> Result<Vec<Screen>> {
        Ok(self.lock()?.screens.values().cloned().collect())
    }

    pub fn transitions(&self) -> Result<Vec<ScreenTransition>> {
        Ok(self.lock()?.transitions.clone())
    }

    pub fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        Ok(self
            .lock()?
            .steps
            .iter()
            .filter(|record| record.run_id == run_id)
            .cloned()
            .collect())
    }
}

fn run_mut<'a>(tables: &'a mut Tables, run_id: &str) -> Result<&'a mut CrawlRun> {
    tables
        .runs
        .get_mut(run_id)
        .ok_or_else(|| anyhow!("unknown run {run_id}"))
}

impl RunStore for MemoryStore {
    fn get_run(&self, run_id: &str) -> Result<CrawlRun> {
        self.lock()?
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown run {run_id}"))
    }

    fn mark_running(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.lock()?;
        let run = run_mut(&mut tables, run_id)?;
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        Ok(())
    }

    fn update_progress(&self, run_id: &str, step_count: u32, screen_count: u32) -> Result<()> {
        let mut tables = self.lock()?;
        let run = run_mut(&mut tables, run_id)?;
        run.step_count = step_count;
        run.screen_count = screen_count;
        Ok(())
    }

    fn finish_run(&self, run_id: &str, status: RunStatus, ended_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.lock()?;
        let run = run_mut(&mut tables, run_id)?;
        run.status = status;
        run.ended_at = Some(ended_at);
        Ok(())
    }
}

impl ScreenStore for MemoryStore {
    fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Screen>> {
        Ok(self
            .lock()?
            .screens
            .values()
            .find(|screen| screen.fingerprint == fingerprint)
            .cloned())
    }

    fn find_similar(&self, fingerprint: &str, max_distance: u32) -> Result<Option<(Screen, u32)>> {
        let tables = self.lock()?;
        let candidates = tables
            .screens
            .values()
            .map(|screen| (screen, screen.fingerprint.as_str()));
        Ok(closest_match(fingerprint, candidates, max_distance)
            .map(|(screen, distance)| (screen.clone(), distance)))
    }

    fn create_screen(&self, screen: NewScreen) -> Result<Screen> {
        let mut tables = self.lock()?;
        tables.next_screen_id += 1;
        let created = Screen {
            id: tables.next_screen_id,
            fingerprint: screen.fingerprint,
            screenshot_path: screen.screenshot_path,
            activity: screen.activity,
            first_seen_run: screen.first_seen_run,
            first_seen_step: screen.first_seen_step,
        };
        tables.screens.insert(created.id, created.clone());
        Ok(created)
    }

    fn record_transition(&self, transition: &ScreenTransition) -> Result<()> {
        self.lock()?.transitions.push(transition.clone());
        Ok(())
    }
}

impl StepStore for MemoryStore {
    fn record_step(&self, record: &StepRecord) -> Result<()> {
        self.lock()?.steps.push(record.clone());
        Ok(())
    }
}
