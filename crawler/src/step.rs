//! A single exploration step.
//!
//! Event order within a completed step is fixed: `step_started`,
//! `screenshot_captured`, then per oracle attempt `ai_request_sent` (with
//! `ai_waiting` heartbeats) and `ai_response_received`, one
//! `action_executed` per executed action, `screen_processed` and finally
//! `step_completed`. Recovery events appear between a crashed operation and
//! its re-run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::{Action, ActionResult, ScreenObservation, StepRecord};
use crate::crawl_loop::{CrawlLoop, Session, StopReason};
use crate::events::{CrawlEvent, millis};
use crate::foreground::{ForegroundOutcome, ensure_foreground};
use crate::heartbeat::Heartbeat;
use crate::io::grounding::GroundingResult;
use crate::io::history::HistoryEntry;
use crate::io::oracle::OracleContext;
use crate::io::store::RepositoryError;

const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Completed,
    /// The step produced nothing usable; the loop may try another.
    Failed(String),
    /// The run must end.
    Stop(StopReason),
}

enum Abort {
    Failed(String),
    Stop(StopReason),
}

fn failed(err: anyhow::Error) -> Abort {
    Abort::Failed(format!("{err:#}"))
}

fn repository(err: anyhow::Error) -> Abort {
    let message = format!("{err:#}");
    if RepositoryError::is_repository_failure(&err) {
        Abort::Stop(StopReason::RepositoryFailure(message))
    } else {
        Abort::Failed(message)
    }
}

/// `<artifacts>/<run_id>/step-<n>.png`
pub fn screenshot_path(artifacts_dir: &Path, run_id: &str, step: u32) -> PathBuf {
    artifacts_dir.join(run_id).join(format!("step-{step}.png"))
}

fn write_screenshot(path: &Path, png: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("create screenshot dir {}", dir.display()))?;
    }
    fs::write(path, png).with_context(|| format!("write screenshot {}", path.display()))
}

impl CrawlLoop {
    #[instrument(skip_all, fields(run_id = %session.run_id, step = step))]
    pub(crate) fn run_step(&self, session: &mut Session, step: u32) -> StepOutcome {
        match self.try_step(session, step) {
            Ok(()) => StepOutcome::Completed,
            Err(Abort::Failed(err)) => StepOutcome::Failed(err),
            Err(Abort::Stop(reason)) => StepOutcome::Stop(reason),
        }
    }

    fn try_step(&self, s: &mut Session, step: u32) -> Result<(), Abort> {
        let clock = self.services.clock.clone();
        let started = clock.now();
        s.recovery.reset_for_new_step();
        self.emit(CrawlEvent::StepStarted {
            run_id: s.run_id.clone(),
            step,
        });

        self.restore_foreground(s, step)?;

        let png = self.with_recovery(s, step, |this| {
            this.services.driver.screenshot().context("capture screenshot")
        })?;
        let path = screenshot_path(&s.cfg.artifacts_dir, &s.run_id, step);
        write_screenshot(&path, &png).map_err(failed)?;
        self.emit(CrawlEvent::ScreenshotCaptured {
            run_id: s.run_id.clone(),
            step,
            path: path.clone(),
        });

        let activity = self
            .services
            .driver
            .current_activity()
            .unwrap_or_else(|err| {
                debug!(err = %format!("{err:#}"), "activity unavailable");
                None
            });
        let observation = s
            .tracker
            .process_screen(&png, activity.as_deref(), step, Some(&path))
            .map_err(repository)?;

        let grounding_started = clock.now();
        let grounding = self
            .services
            .grounding
            .process(&path)
            .context("ground screenshot")
            .map_err(failed)?;
        s.grounding_total += clock.now().saturating_duration_since(grounding_started);
        s.grounding_samples += 1;

        let actions = self.request_actions(s, step, &path, &grounding, &observation)?;

        let mut results = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let (result, exhausted) = self.execute_with_recovery(s, step, action);
            self.emit(CrawlEvent::ActionExecuted {
                run_id: s.run_id.clone(),
                step,
                index,
                result: result.clone(),
            });
            s.history.push(HistoryEntry::from_result(step, action, &result));
            if let Some(message) = exhausted {
                return Err(Abort::Stop(StopReason::RecoveryExhausted(message)));
            }
            let end_batch = !result.success || result.navigated_away;
            results.push(result);
            if end_batch {
                debug!(index, planned = actions.len(), "ending action batch early");
                break;
            }
        }

        self.update_stuck(s, &observation);
        self.emit(CrawlEvent::ScreenProcessed {
            run_id: s.run_id.clone(),
            step,
            observation,
        });

        let duration = clock.now().saturating_duration_since(started);
        let action_count = results.len();
        let record = StepRecord {
            run_id: s.run_id.clone(),
            step,
            screen_id: observation.screen_id,
            actions,
            results,
            duration_ms: millis(duration),
            stuck: s.stuck.is_stuck(),
        };
        if let Err(err) = self.services.steps.record_step(&record) {
            return Err(Abort::Stop(StopReason::RepositoryFailure(format!(
                "record step {step}: {err:#}"
            ))));
        }

        self.emit(CrawlEvent::StepCompleted {
            run_id: s.run_id.clone(),
            step,
            action_count,
            duration_ms: millis(duration),
        });
        Ok(())
    }

    fn restore_foreground(&self, s: &mut Session, step: u32) -> Result<(), Abort> {
        let package = s.target_package.clone();
        let back_attempts = s.cfg.foreground.back_attempts;
        let settle = Duration::from_millis(s.cfg.foreground.settle_ms);
        let outcome = self.with_recovery(s, step, |this| {
            ensure_foreground(
                this.services.driver.as_ref(),
                this.services.clock.as_ref(),
                &package,
                back_attempts,
                settle,
            )
        })?;
        if outcome == ForegroundOutcome::Lost {
            self.emit(CrawlEvent::Error {
                run_id: s.run_id.clone(),
                step: Some(step),
                error: format!("could not bring {package} to the foreground"),
            });
        }
        Ok(())
    }

    /// Ask the oracle until it returns valid actions or attempts run out.
    fn request_actions(
        &self,
        s: &Session,
        step: u32,
        screenshot: &Path,
        grounding: &GroundingResult,
        observation: &ScreenObservation,
    ) -> Result<Vec<Action>, Abort> {
        let history = self.renderer.render(&s.history).map_err(failed)?;
        let attempts = s.cfg.oracle_max_retries.saturating_add(1);
        let mut previous_error: Option<String> = None;

        for attempt in 1..=attempts {
            let context = OracleContext {
                run_id: s.run_id.clone(),
                step,
                target_package: s.target_package.clone(),
                screenshot_path: screenshot.to_path_buf(),
                annotated_path: grounding.annotated_path.clone(),
                elements: grounding.elements.clone(),
                history: history.clone(),
                is_new_screen: observation.is_new,
                visit_count: observation.visit_count,
                total_screens: observation.total_screens,
                stuck: s.stuck.is_stuck(),
                stuck_reason: s.stuck.stuck_reason().map(str::to_string),
                attempt,
                previous_error: previous_error.clone(),
            };
            let payload = serde_json::to_value(&context)
                .unwrap_or_else(|err| json!({ "error": err.to_string() }));
            self.emit(CrawlEvent::AiRequestSent {
                run_id: s.run_id.clone(),
                step,
                payload,
            });

            match self.call_oracle(s, step, &context) {
                Ok(raw) => {
                    self.emit(CrawlEvent::AiResponseReceived {
                        run_id: s.run_id.clone(),
                        step,
                        payload: raw.clone(),
                    });
                    match self.validator.validate(&raw, &grounding.label_map) {
                        Ok(actions) => {
                            debug!(attempt, count = actions.len(), "oracle actions accepted");
                            return Ok(actions);
                        }
                        Err(err) => {
                            warn!(attempt, %err, "oracle response rejected");
                            previous_error = Some(err.to_string());
                        }
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(attempt, err = %message, "oracle call failed");
                    previous_error = Some(message);
                }
            }
        }

        Err(Abort::Failed(format!(
            "no valid oracle actions after {attempts} attempts: {}",
            previous_error.unwrap_or_default()
        )))
    }

    /// One oracle call with `ai_waiting` heartbeats while it blocks.
    fn call_oracle(&self, s: &Session, step: u32, context: &OracleContext) -> Result<Value> {
        let listeners = self.listeners.clone();
        let run_id = s.run_id.clone();
        let interval = Duration::from_millis(s.cfg.heartbeat_interval_ms);
        let heartbeat = match Heartbeat::spawn(interval, move |elapsed| {
            listeners.emit(&CrawlEvent::AiWaiting {
                run_id: run_id.clone(),
                step,
                elapsed_ms: millis(elapsed),
            });
        }) {
            Ok(heartbeat) => Some(heartbeat),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "oracle heartbeat unavailable");
                None
            }
        };

        let reply = self.services.oracle.next_actions(context);
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop(HEARTBEAT_JOIN_TIMEOUT);
        }
        reply
    }

    /// Run `op`, restarting the session and re-running it after crashes.
    fn with_recovery<T>(
        &self,
        s: &mut Session,
        step: u32,
        op: impl Fn(&Self) -> Result<T>,
    ) -> Result<T, Abort> {
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let message = format!("{err:#}");
                    if !s.recovery.is_crash(&message) {
                        return Err(Abort::Failed(message));
                    }
                    self.recover(s, step, &message)
                        .map_err(|message| Abort::Stop(StopReason::RecoveryExhausted(message)))?;
                }
            }
        }
    }

    /// Execute one action; a crash restarts the session and re-executes it.
    ///
    /// The second value carries the crash message once recovery is exhausted.
    fn execute_with_recovery(
        &self,
        s: &mut Session,
        step: u32,
        action: &Action,
    ) -> (ActionResult, Option<String>) {
        loop {
            let result = s.executor.execute(action);
            if result.success {
                return (result, None);
            }
            let message = result.error.clone().unwrap_or_default();
            if !s.recovery.is_crash(&message) {
                return (result, None);
            }
            if let Err(message) = self.recover(s, step, &message) {
                return (result, Some(message));
            }
        }
    }

    /// Restart attempts until one succeeds or the step's budget is spent.
    fn recover(&self, s: &mut Session, step: u32, message: &str) -> Result<(), String> {
        loop {
            if !s.recovery.should_retry() {
                let attempts = s.recovery.attempts();
                error!(attempts, %message, "session recovery exhausted");
                self.emit(CrawlEvent::RecoveryExhausted {
                    run_id: s.run_id.clone(),
                    step,
                    attempts,
                    message: message.to_string(),
                });
                return Err(message.to_string());
            }

            warn!(%message, "automation session crashed");
            self.emit(CrawlEvent::RecoveryStarted {
                run_id: s.run_id.clone(),
                step,
                attempt: s.recovery.attempts() + 1,
            });
            let result = s.recovery.attempt_recovery(self.services.driver.as_ref());
            self.emit(CrawlEvent::RecoveryCompleted {
                run_id: s.run_id.clone(),
                step,
                attempt: result.attempt_number,
                success: result.success,
                duration_ms: millis(result.duration),
            });
            if result.success {
                return Ok(());
            }
        }
    }

    /// Leaving a stuck screen counts as a successful escape.
    fn update_stuck(&self, s: &mut Session, observation: &ScreenObservation) {
        let screen_id = observation.screen_id;
        if s.stuck.is_stuck() && s.stuck.current_screen() != Some(screen_id) {
            info!(screen_id, "left stuck screen");
            s.stuck.record_recovery(true);
        }
        if s.stuck.record_screen_visit(screen_id) {
            warn!(
                screen_id,
                reason = s.stuck.stuck_reason().unwrap_or_default(),
                "exploration stuck"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshots_are_grouped_per_run() {
        assert_eq!(
            screenshot_path(Path::new("artifacts"), "run-7", 12),
            PathBuf::from("artifacts/run-7/step-12.png")
        );
    }

    #[test]
    fn store_marker_decides_between_failure_and_stop() {
        let store_err = anyhow::anyhow!("disk full").context(RepositoryError::new("create screen"));
        assert!(matches!(
            repository(store_err),
            Abort::Stop(StopReason::RepositoryFailure(message)) if message.contains("disk full")
        ));
        let decode_err = anyhow::anyhow!("bad png").context("fingerprint screenshot");
        assert!(matches!(repository(decode_err), Abort::Failed(_)));
    }
}
