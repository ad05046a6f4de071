//! Validated lifecycle transitions for a single run.
//!
//! The adjacency table below is the only source of truth for which phase may
//! follow which. Same-state transitions are always accepted and do nothing.

use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::LifecycleState;

/// Attempted transition outside the adjacency table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

type LifecycleListener = Box<dyn Fn(LifecycleState, LifecycleState) -> anyhow::Result<()> + Send>;

/// States reachable from `state` in one transition (excluding the no-op).
pub fn allowed_targets(state: LifecycleState) -> &'static [LifecycleState] {
    use LifecycleState::{Error, Initializing, PausedManual, Running, Stopped, Stopping};
    match state {
        LifecycleState::Uninitialized => &[Initializing, Error],
        Initializing => &[Running, Error],
        Running => &[PausedManual, Stopping, Error],
        PausedManual => &[Running, Stopping, Error],
        Stopping => &[Stopped, Error],
        Stopped | Error => &[],
    }
}

pub fn can_transition(from: LifecycleState, to: LifecycleState) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

pub struct LifecycleMachine {
    state: LifecycleState,
    listeners: Vec<LifecycleListener>,
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Register a listener invoked with `(old, new)` after every real transition.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(LifecycleState, LifecycleState) -> anyhow::Result<()> + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn transition_to(&mut self, target: LifecycleState) -> Result<(), InvalidTransition> {
        let from = self.state;
        if from == target {
            return Ok(());
        }
        if !can_transition(from, target) {
            return Err(InvalidTransition { from, to: target });
        }
        self.state = target;
        debug!(%from, to = %target, "lifecycle transition");
        self.notify(from, target);
        Ok(())
    }

    fn notify(&self, from: LifecycleState, to: LifecycleState) {
        for (index, listener) in self.listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(from, to))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(index, err = %format!("{err:#}"), "lifecycle listener failed");
                }
                Err(_) => warn!(index, "lifecycle listener panicked"),
            }
        }
    }
}
