//! Crawl event listeners.
//!
//! The loop reports progress through [`CrawlListener`], one method per event.
//! Every method defaults to forwarding a [`CrawlEvent`] to
//! [`CrawlListener::on_event`], so a listener can either handle specific
//! events or consume the whole stream generically. [`ListenerSet`] fans an
//! event out to every registered listener and contains their failures: an
//! `Err` or a panic from one listener is logged and the next one still runs.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::types::{ActionResult, LifecycleState, ScreenObservation};

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable form of every listener call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    CrawlStarted {
        run_id: String,
        target_package: String,
    },
    StepStarted {
        run_id: String,
        step: u32,
    },
    ScreenshotCaptured {
        run_id: String,
        step: u32,
        path: PathBuf,
    },
    AiRequestSent {
        run_id: String,
        step: u32,
        payload: Value,
    },
    AiWaiting {
        run_id: String,
        step: u32,
        elapsed_ms: u64,
    },
    AiResponseReceived {
        run_id: String,
        step: u32,
        payload: Value,
    },
    ActionExecuted {
        run_id: String,
        step: u32,
        index: usize,
        result: ActionResult,
    },
    ScreenProcessed {
        run_id: String,
        step: u32,
        observation: ScreenObservation,
    },
    StepCompleted {
        run_id: String,
        step: u32,
        action_count: usize,
        duration_ms: u64,
    },
    RecoveryStarted {
        run_id: String,
        step: u32,
        attempt: u32,
    },
    RecoveryCompleted {
        run_id: String,
        step: u32,
        attempt: u32,
        success: bool,
        duration_ms: u64,
    },
    RecoveryExhausted {
        run_id: String,
        step: u32,
        attempts: u32,
        message: String,
    },
    StateChanged {
        run_id: String,
        old: LifecycleState,
        new: LifecycleState,
    },
    Error {
        run_id: String,
        step: Option<u32>,
        error: String,
    },
    CrawlCompleted {
        run_id: String,
        total_steps: u32,
        duration_ms: u64,
        reason: String,
        average_grounding_ms: Option<u64>,
    },
}

impl CrawlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CrawlEvent::CrawlStarted { .. } => "crawl_started",
            CrawlEvent::StepStarted { .. } => "step_started",
            CrawlEvent::ScreenshotCaptured { .. } => "screenshot_captured",
            CrawlEvent::AiRequestSent { .. } => "ai_request_sent",
            CrawlEvent::AiWaiting { .. } => "ai_waiting",
            CrawlEvent::AiResponseReceived { .. } => "ai_response_received",
            CrawlEvent::ActionExecuted { .. } => "action_executed",
            CrawlEvent::ScreenProcessed { .. } => "screen_processed",
            CrawlEvent::StepCompleted { .. } => "step_completed",
            CrawlEvent::RecoveryStarted { .. } => "recovery_started",
            CrawlEvent::RecoveryCompleted { .. } => "recovery_completed",
            CrawlEvent::RecoveryExhausted { .. } => "recovery_exhausted",
            CrawlEvent::StateChanged { .. } => "state_changed",
            CrawlEvent::Error { .. } => "error",
            CrawlEvent::CrawlCompleted { .. } => "crawl_completed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            CrawlEvent::CrawlStarted { run_id, .. }
            | CrawlEvent::StepStarted { run_id, .. }
            | CrawlEvent::ScreenshotCaptured { run_id, .. }
            | CrawlEvent::AiRequestSent { run_id, .. }
            | CrawlEvent::AiWaiting { run_id, .. }
            | CrawlEvent::AiResponseReceived { run_id, .. }
            | CrawlEvent::ActionExecuted { run_id, .. }
            | CrawlEvent::ScreenProcessed { run_id, .. }
            | CrawlEvent::StepCompleted { run_id, .. }
            | CrawlEvent::RecoveryStarted { run_id, .. }
            | CrawlEvent::RecoveryCompleted { run_id, .. }
            | CrawlEvent::RecoveryExhausted { run_id, .. }
            | CrawlEvent::StateChanged { run_id, .. }
            | CrawlEvent::Error { run_id, .. }
            | CrawlEvent::CrawlCompleted { run_id, .. } => run_id,
        }
    }

    /// Invoke the typed handler on `listener` that corresponds to this event.
    pub fn dispatch(&self, listener: &dyn CrawlListener) -> Result<()> {
        match self {
            CrawlEvent::CrawlStarted {
                run_id,
                target_package,
            } => listener.crawl_started(run_id, target_package),
            CrawlEvent::StepStarted { run_id, step } => listener.step_started(run_id, *step),
            CrawlEvent::ScreenshotCaptured { run_id, step, path } => {
                listener.screenshot_captured(run_id, *step, path)
            }
            CrawlEvent::AiRequestSent {
                run_id,
                step,
                payload,
            } => listener.ai_request_sent(run_id, *step, payload),
            CrawlEvent::AiWaiting {
                run_id,
                step,
                elapsed_ms,
            } => listener.ai_waiting(run_id, *step, Duration::from_millis(*elapsed_ms)),
            CrawlEvent::AiResponseReceived {
                run_id,
                step,
                payload,
            } => listener.ai_response_received(run_id, *step, payload),
            CrawlEvent::ActionExecuted {
                run_id,
                step,
                index,
                result,
            } => listener.action_executed(run_id, *step, *index, result),
            CrawlEvent::ScreenProcessed {
                run_id,
                step,
                observation,
            } => listener.screen_processed(run_id, *step, observation),
            CrawlEvent::StepCompleted {
                run_id,
                step,
                action_count,
                duration_ms,
            } => listener.step_completed(
                run_id,
                *step,
                *action_count,
                Duration::from_millis(*duration_ms),
            ),
            CrawlEvent::RecoveryStarted {
                run_id,
                step,
                attempt,
            } => listener.recovery_started(run_id, *step, *attempt),
            CrawlEvent::RecoveryCompleted {
                run_id,
                step,
                attempt,
                success,
                duration_ms,
            } => listener.recovery_completed(
                run_id,
                *step,
                *attempt,
                *success,
                Duration::from_millis(*duration_ms),
            ),
            CrawlEvent::RecoveryExhausted {
                run_id,
                step,
                attempts,
                message,
            } => listener.recovery_exhausted(run_id, *step, *attempts, message),
            CrawlEvent::StateChanged { run_id, old, new } => {
                listener.state_changed(run_id, *old, *new)
            }
            CrawlEvent::Error {
                run_id,
                step,
                error,
            } => listener.error(run_id, *step, error),
            CrawlEvent::CrawlCompleted {
                run_id,
                total_steps,
                duration_ms,
                reason,
                average_grounding_ms,
            } => listener.crawl_completed(
                run_id,
                *total_steps,
                Duration::from_millis(*duration_ms),
                reason,
                average_grounding_ms.map(Duration::from_millis),
            ),
        }
    }
}

/// Receiver of crawl progress.
///
/// Handlers run synchronously on the loop thread, except `ai_waiting` which
/// runs on the heartbeat thread. They should return quickly.
pub trait CrawlListener: Send + Sync {
    /// Catch-all that every default handler forwards to.
    fn on_event(&self, _event: &CrawlEvent) -> Result<()> {
        Ok(())
    }

    fn crawl_started(&self, run_id: &str, target_package: &str) -> Result<()> {
        self.on_event(&CrawlEvent::CrawlStarted {
            run_id: run_id.to_string(),
            target_package: target_package.to_string(),
        })
    }

    fn step_started(&self, run_id: &str, step: u32) -> Result<()> {
        self.on_event(&CrawlEvent::StepStarted {
            run_id: run_id.to_string(),
            step,
        })
    }

    fn screenshot_captured(&self, run_id: &str, step: u32, path: &Path) -> Result<()> {
        self.on_event(&CrawlEvent::ScreenshotCaptured {
            run_id: run_id.to_string(),
            step,
            path: path.to_path_buf(),
        })
    }

    fn ai_request_sent(&self, run_id: &str, step: u32, payload: &Value) -> Result<()> {
        self.on_event(&CrawlEvent::AiRequestSent {
            run_id: run_id.to_string(),
            step,
            payload: payload.clone(),
        })
    }

    fn ai_waiting(&self, run_id: &str, step: u32, elapsed: Duration) -> Result<()> {
        self.on_event(&CrawlEvent::AiWaiting {
            run_id: run_id.to_string(),
            step,
            elapsed_ms: millis(elapsed),
        })
    }

    fn ai_response_received(&self, run_id: &str, step: u32, payload: &Value) -> Result<()> {
        self.on_event(&CrawlEvent::AiResponseReceived {
            run_id: run_id.to_string(),
            step,
            payload: payload.clone(),
        })
    }

    fn action_executed(
        &self,
        run_id: &str,
        step: u32,
        index: usize,
        result: &ActionResult,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::ActionExecuted {
            run_id: run_id.to_string(),
            step,
            index,
            result: result.clone(),
        })
    }

    fn screen_processed(
        &self,
        run_id: &str,
        step: u32,
        observation: &ScreenObservation,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::ScreenProcessed {
            run_id: run_id.to_string(),
            step,
            observation: *observation,
        })
    }

    fn step_completed(
        &self,
        run_id: &str,
        step: u32,
        action_count: usize,
        duration: Duration,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::StepCompleted {
            run_id: run_id.to_string(),
            step,
            action_count,
            duration_ms: millis(duration),
        })
    }

    fn recovery_started(&self, run_id: &str, step: u32, attempt: u32) -> Result<()> {
        self.on_event(&CrawlEvent::RecoveryStarted {
            run_id: run_id.to_string(),
            step,
            attempt,
        })
    }

    fn recovery_completed(
        &self,
        run_id: &str,
        step: u32,
        attempt: u32,
        success: bool,
        duration: Duration,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::RecoveryCompleted {
            run_id: run_id.to_string(),
            step,
            attempt,
            success,
            duration_ms: millis(duration),
        })
    }

    fn recovery_exhausted(
        &self,
        run_id: &str,
        step: u32,
        attempts: u32,
        message: &str,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::RecoveryExhausted {
            run_id: run_id.to_string(),
            step,
            attempts,
            message: message.to_string(),
        })
    }

    fn state_changed(&self, run_id: &str, old: LifecycleState, new: LifecycleState) -> Result<()> {
        self.on_event(&CrawlEvent::StateChanged {
            run_id: run_id.to_string(),
            old,
            new,
        })
    }

    fn error(&self, run_id: &str, step: Option<u32>, error: &str) -> Result<()> {
        self.on_event(&CrawlEvent::Error {
            run_id: run_id.to_string(),
            step,
            error: error.to_string(),
        })
    }

    fn crawl_completed(
        &self,
        run_id: &str,
        total_steps: u32,
        duration: Duration,
        reason: &str,
        average_grounding: Option<Duration>,
    ) -> Result<()> {
        self.on_event(&CrawlEvent::CrawlCompleted {
            run_id: run_id.to_string(),
            total_steps,
            duration_ms: millis(duration),
            reason: reason.to_string(),
            average_grounding_ms: average_grounding.map(millis),
        })
    }
}

/// Registered listeners, cheap to clone and share with the heartbeat thread.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn CrawlListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn CrawlListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver `event` to every listener in registration order.
    pub fn emit(&self, event: &CrawlEvent) {
        for (index, listener) in self.listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| event.dispatch(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    index,
                    event = event.name(),
                    err = %format!("{err:#}"),
                    "crawl listener failed"
                ),
                Err(_) => warn!(index, event = event.name(), "crawl listener panicked"),
            }
        }
    }
}

/// Structured `tracing` output for every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl CrawlListener for TracingListener {
    fn on_event(&self, event: &CrawlEvent) -> Result<()> {
        let name = event.name();
        let run_id = event.run_id();
        match event {
            CrawlEvent::Error { step, error, .. } => {
                warn!(run_id, event = name, step = ?step, %error, "crawl error");
            }
            CrawlEvent::RecoveryExhausted {
                step,
                attempts,
                message,
                ..
            } => {
                warn!(run_id, event = name, step, attempts, %message, "recovery exhausted");
            }
            CrawlEvent::RecoveryStarted { step, attempt, .. } => {
                warn!(run_id, event = name, step, attempt, "session recovery started");
            }
            CrawlEvent::AiWaiting {
                step, elapsed_ms, ..
            } => debug!(run_id, event = name, step, elapsed_ms, "waiting for oracle"),
            CrawlEvent::AiRequestSent { step, .. }
            | CrawlEvent::AiResponseReceived { step, .. } => {
                debug!(run_id, event = name, step, "oracle exchange");
            }
            CrawlEvent::CrawlCompleted {
                total_steps,
                duration_ms,
                reason,
                ..
            } => info!(run_id, event = name, total_steps, duration_ms, %reason, "crawl completed"),
            other => {
                let fields = serde_json::to_string(other).unwrap_or_default();
                info!(run_id, event = name, %fields, "crawl event");
            }
        }
        Ok(())
    }
}

/// Destination for serialized events.
pub trait EventSink: Send + Sync {
    fn send(&self, event: CrawlEvent) -> Result<()>;
}

/// Adapts an [`EventSink`] to the listener interface.
pub struct EventBridge<S> {
    sink: S,
}

impl<S: EventSink> EventBridge<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: EventSink> CrawlListener for EventBridge<S> {
    fn on_event(&self, event: &CrawlEvent) -> Result<()> {
        self.sink.send(event.clone())
    }
}

/// Forwards events over a channel, e.g. to an operator console thread.
pub struct ChannelSink {
    sender: Sender<CrawlEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<CrawlEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: CrawlEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| anyhow!("event channel closed"))
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn send(&self, event: CrawlEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event).context("serialize event")?;
        line.push('\n');
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
            .with_context(|| format!("append event log {}", self.path.display()))
    }
}
