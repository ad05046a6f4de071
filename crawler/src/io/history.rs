//! Rolling exploration history rendered for the oracle.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Action, ActionKind, ActionResult};

const HISTORY_TEMPLATE: &str = include_str!("templates/history.md");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub action: ActionKind,
    pub target: Option<String>,
    pub input_text: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub navigated_away: bool,
}

impl HistoryEntry {
    pub fn from_result(step: u32, action: &Action, result: &ActionResult) -> Self {
        Self {
            step,
            action: action.kind,
            target: action
                .label
                .as_ref()
                .map(|label| format!("[{label}]"))
                .or_else(|| (!result.target.is_empty()).then(|| result.target.clone())),
            input_text: action.input_text.clone(),
            success: result.success,
            error: result.error.clone(),
            navigated_away: result.navigated_away,
        }
    }
}

/// Keeps the last `capacity` executed actions.
#[derive(Debug, Clone)]
pub struct ExplorationHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl ExplorationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct HistoryRenderer {
    env: Environment<'static>,
}

impl HistoryRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("history", HISTORY_TEMPLATE)
            .context("load history template")?;
        Ok(Self { env })
    }

    pub fn render(&self, history: &ExplorationHistory) -> Result<String> {
        let entries: Vec<&HistoryEntry> = history.entries().collect();
        let template = self.env.get_template("history")?;
        let rendered = template
            .render(context! { entries => entries })
            .context("render history")?;
        Ok(rendered.trim_end().to_string())
    }
}
