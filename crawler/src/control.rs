//! Operator intent: pause, resume and stop.
//!
//! [`RunController`] is shared between the crawl loop and whatever surface
//! the operator uses. It is independent of the lifecycle machine:
//! it records what the operator asked for, and the loop reacts at its next
//! step boundary. Illegal requests (resume while stopped, double pause) are
//! ignored and reported as `false`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::types::ControlState;

type ControlListener = Arc<dyn Fn(ControlState) -> anyhow::Result<()> + Send + Sync>;

struct Inner {
    state: ControlState,
    listeners: Vec<ControlListener>,
}

pub struct RunController {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}

impl RunController {
    /// A new controller is stopped until a run starts it.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ControlState::Stopped,
                listeners: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ControlState {
        self.lock().state
    }

    pub fn should_continue(&self) -> bool {
        self.state() == ControlState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ControlState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ControlState::Stopped
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(ControlState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.lock().listeners.push(Arc::new(listener));
    }

    /// Stopped -> Running.
    pub fn start(&self) -> bool {
        self.transition(|state| state == ControlState::Stopped, ControlState::Running)
    }

    /// Running -> Paused.
    pub fn pause(&self) -> bool {
        self.transition(|state| state == ControlState::Running, ControlState::Paused)
    }

    /// Paused -> Running.
    pub fn resume(&self) -> bool {
        self.transition(|state| state == ControlState::Paused, ControlState::Running)
    }

    /// Any non-stopped state -> Stopped.
    pub fn stop(&self) -> bool {
        self.transition(|state| state != ControlState::Stopped, ControlState::Stopped)
    }

    /// Back to Stopped with no listeners, for reuse across independent runs.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = ControlState::Stopped;
        inner.listeners.clear();
        drop(inner);
        self.changed.notify_all();
    }

    /// Block while paused, up to `timeout`, and return the state afterwards.
    pub fn wait_while_paused(&self, timeout: Duration) -> ControlState {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| inner.state == ControlState::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        guard.state
    }

    fn transition(&self, allowed: impl Fn(ControlState) -> bool, next: ControlState) -> bool {
        let mut inner = self.lock();
        let current = inner.state;
        if !allowed(current) {
            debug!(?current, requested = ?next, "ignoring control request");
            return false;
        }
        inner.state = next;
        let listeners = inner.listeners.clone();
        drop(inner);

        self.changed.notify_all();
        debug!(from = ?current, to = ?next, "control state changed");
        for (index, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(next))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(index, err = %format!("{err:#}"), "control listener failed"),
                Err(_) => warn!(index, "control listener panicked"),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn transitions_follow_operator_rules() {
        let controller = RunController::new();
        assert!(!controller.should_continue());
        assert!(!controller.pause());
        assert!(!controller.resume());

        assert!(controller.start());
        assert!(controller.should_continue());
        assert!(!controller.resume());
        assert!(controller.pause());
        assert!(!controller.pause());
        assert!(controller.is_paused());
        assert!(controller.resume());
        assert!(controller.stop());
        assert!(!controller.stop());
        assert!(!controller.resume());
        assert_eq!(controller.state(), ControlState::Stopped);

        assert!(controller.start());
        assert!(controller.pause());
        assert!(controller.stop());
    }

    #[test]
    fn listeners_see_each_change_and_failures_are_contained() {
        let controller = RunController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        controller.add_listener(|_| Err(anyhow::anyhow!("listener broke")));
        controller.add_listener(|_| panic!("listener exploded"));
        let sink = Arc::clone(&seen);
        controller.add_listener(move |state| {
            sink.lock().expect("lock").push(state);
            Ok(())
        });

        controller.start();
        controller.pause();
        controller.pause();
        controller.stop();
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![ControlState::Running, ControlState::Paused, ControlState::Stopped]
        );
    }

    #[test]
    fn reset_drops_listeners() {
        let controller = RunController::new();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        controller.add_listener(move |_| {
            *sink.lock().expect("lock") += 1;
            Ok(())
        });
        controller.start();
        controller.reset();
        assert!(controller.is_stopped());
        controller.start();
        assert_eq!(*seen.lock().expect("lock"), 1);
    }

    #[test]
    fn wait_while_paused_wakes_on_resume() {
        let controller = Arc::new(RunController::new());
        controller.start();
        controller.pause();

        let remote = Arc::clone(&controller);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.resume();
        });

        let started = Instant::now();
        let state = controller.wait_while_paused(Duration::from_secs(10));
        handle.join().expect("join");
        assert_eq!(state, ControlState::Running);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn wait_while_paused_returns_immediately_when_running() {
        let controller = RunController::new();
        controller.start();
        assert_eq!(
            controller.wait_while_paused(Duration::from_secs(10)),
            ControlState::Running
        );
    }
}
