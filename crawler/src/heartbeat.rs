//! Periodic progress callbacks while a blocking call is in flight.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::events::millis;

const JOIN_POLL: Duration = Duration::from_millis(5);
const DROP_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

type StopSignal = Arc<(Mutex<bool>, Condvar)>;

/// Background worker calling `on_beat(elapsed)` every `interval` until
/// stopped. Stopping wakes it immediately; dropping it stops it too.
pub struct Heartbeat {
    signal: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn<F>(interval: Duration, mut on_beat: F) -> Result<Self>
    where
        F: FnMut(Duration) + Send + 'static,
    {
        let signal: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("crawl-heartbeat".to_string())
            .spawn(move || {
                let started = Instant::now();
                let (lock, cvar) = &*worker_signal;
                let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    let (guard, timeout) = cvar
                        .wait_timeout_while(stopped, interval, |stop| !*stop)
                        .unwrap_or_else(PoisonError::into_inner);
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if timeout.timed_out() {
                        drop(stopped);
                        on_beat(started.elapsed());
                        stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                    }
                }
            })
            .context("spawn heartbeat thread")?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the worker and wait up to `join_timeout` for it to exit.
    ///
    /// Returns false when the worker did not exit in time; it is detached and
    /// exits after its current callback.
    pub fn stop(mut self, join_timeout: Duration) -> bool {
        self.shutdown(join_timeout)
    }

    fn shutdown(&mut self, join_timeout: Duration) -> bool {
        let (lock, cvar) = &*self.signal;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();

        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = millis(join_timeout),
                    "heartbeat did not stop in time"
                );
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            warn!("heartbeat callback panicked");
        }
        debug!("heartbeat stopped");
        true
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown(DROP_JOIN_TIMEOUT);
        }
    }
}
