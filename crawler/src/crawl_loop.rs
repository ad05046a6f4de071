//! The exploration loop: one run from start to its single terminal event.
//!
//! [`CrawlLoop::run`] re-reads configuration, walks the lifecycle from
//! `uninitialized` to `running`, then executes steps until a limit is hit,
//! the operator stops it, recovery is exhausted, too many steps fail in a row
//! or a store call fails. Whatever ends the run (including a panic inside a
//! step) goes through [`CrawlLoop::finish`] exactly once: captures stop, the
//! run row is finalized, the lifecycle reaches a terminal state and
//! `crawl_completed` is emitted.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::action_executor::{ActionExecutor, ExecutorSettings};
use crate::control::RunController;
use crate::core::budget::RunClock;
use crate::core::lifecycle::LifecycleMachine;
use crate::core::stuck::StuckDetector;
use crate::core::types::{ControlState, CrawlRun, LifecycleState, RunStatus};
use crate::events::{CrawlEvent, ListenerSet, millis};
use crate::io::capture::AuxiliaryCapture;
use crate::io::clock::Clock;
use crate::io::config::{CrawlerConfig, SharedConfig};
use crate::io::driver::DeviceDriver;
use crate::io::fingerprint::Fingerprinter;
use crate::io::grounding::Grounding;
use crate::io::history::{ExplorationHistory, HistoryRenderer};
use crate::io::mail::MailClient;
use crate::io::oracle::{Oracle, ResponseValidator};
use crate::io::store::{RunStore, ScreenStore, StepStore};
use crate::recovery::SessionRecoveryManager;
use crate::screen_tracker::ScreenTracker;
use crate::step::StepOutcome;

/// Collaborators of one crawl loop.
pub struct CrawlServices {
    pub driver: Arc<dyn DeviceDriver>,
    pub oracle: Arc<dyn Oracle>,
    pub grounding: Arc<dyn Grounding>,
    pub runs: Arc<dyn RunStore>,
    pub screens: Arc<dyn ScreenStore>,
    pub steps: Arc<dyn StepStore>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    pub clock: Arc<dyn Clock>,
    pub mail: Option<Arc<dyn MailClient>>,
    /// Stopped once when each run ends.
    pub captures: Vec<Box<dyn AuxiliaryCapture>>,
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxSteps,
    MaxDuration,
    OperatorStop,
    RecoveryExhausted(String),
    TooManyFailures(String),
    RepositoryFailure(String),
    Panicked(String),
}

impl StopReason {
    /// Normal endings stop the run; everything else ends it in error.
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            StopReason::MaxSteps | StopReason::MaxDuration | StopReason::OperatorStop
        )
    }

    pub fn run_status(&self) -> RunStatus {
        if self.is_error() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxSteps => f.write_str("max steps reached"),
            StopReason::MaxDuration => f.write_str("max duration reached"),
            StopReason::OperatorStop => f.write_str("stopped by operator"),
            StopReason::RecoveryExhausted(err) => write!(f, "recovery exhausted: {err}"),
            StopReason::TooManyFailures(err) => {
                write!(f, "too many consecutive step failures: {err}")
            }
            StopReason::RepositoryFailure(err) => write!(f, "repository failure: {err}"),
            StopReason::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Summary returned when a run ends without panicking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub run_id: String,
    pub reason: StopReason,
    pub final_state: LifecycleState,
    pub steps_completed: u32,
    /// Pause-excluded time up to the last completed step.
    pub duration: Duration,
    pub distinct_screens: u32,
    pub average_grounding: Option<Duration>,
}

/// Per-run state; created by `run`, consumed by `finish`.
pub(crate) struct Session {
    pub(crate) run_id: String,
    pub(crate) target_package: String,
    pub(crate) cfg: CrawlerConfig,
    pub(crate) lifecycle: LifecycleMachine,
    pub(crate) tracker: ScreenTracker,
    pub(crate) stuck: StuckDetector,
    pub(crate) recovery: SessionRecoveryManager,
    pub(crate) executor: ActionExecutor,
    pub(crate) history: ExplorationHistory,
    pub(crate) run_clock: RunClock,
    pub(crate) steps_attempted: u32,
    pub(crate) steps_completed: u32,
    pub(crate) elapsed_at_last_step: Duration,
    pub(crate) consecutive_failures: u32,
    pub(crate) grounding_total: Duration,
    pub(crate) grounding_samples: u32,
}

impl Session {
    pub(crate) fn distinct_screens(&self) -> u32 {
        u32::try_from(self.tracker.distinct_screens()).unwrap_or(u32::MAX)
    }

    pub(crate) fn average_grounding(&self) -> Option<Duration> {
        (self.grounding_samples > 0).then(|| self.grounding_total / self.grounding_samples)
    }
}

pub struct CrawlLoop {
    pub(crate) services: CrawlServices,
    config: SharedConfig,
    pub(crate) controller: Arc<RunController>,
    pub(crate) listeners: ListenerSet,
    pub(crate) validator: ResponseValidator,
    pub(crate) renderer: HistoryRenderer,
}

impl CrawlLoop {
    pub fn new(
        services: CrawlServices,
        config: SharedConfig,
        controller: Arc<RunController>,
        listeners: ListenerSet,
    ) -> Result<Self> {
        Ok(Self {
            services,
            config,
            controller,
            listeners,
            validator: ResponseValidator::new()?,
            renderer: HistoryRenderer::new()?,
        })
    }

    pub fn controller(&self) -> &Arc<RunController> {
        &self.controller
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: CrawlEvent) {
        self.listeners.emit(&event);
    }

    /// Stop every capture; a failing or panicking one does not skip the rest.
    fn stop_captures(&mut self) {
        for capture in &mut self.services.captures {
            match panic::catch_unwind(AssertUnwindSafe(|| capture.stop())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    capture = capture.name(),
                    err = %format!("{err:#}"),
                    "capture stop failed"
                ),
                Err(payload) => warn!(
                    capture = capture.name(),
                    message = %panic_message(payload.as_ref()),
                    "capture stop panicked"
                ),
            }
        }
    }

    /// Run `run_id` to completion.
    ///
    /// Errors only when the run cannot begin (invalid config, unknown run).
    /// A panic inside the loop is re-raised after the run is finalized.
    #[instrument(skip(self))]
    pub fn run(&mut self, run_id: &str) -> Result<CrawlOutcome> {
        let cfg = self.config.snapshot()?;
        cfg.validate().context("validate crawler config")?;
        let run = self
            .services
            .runs
            .get_run(run_id)
            .with_context(|| format!("load run {run_id}"))?;

        let mut session = self.open_session(&run, cfg);
        let driven = panic::catch_unwind(AssertUnwindSafe(|| self.drive(&mut session)));
        match driven {
            Ok(reason) => Ok(self.finish(session, reason)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(run_id, %message, "crawl loop panicked");
                self.finish(session, StopReason::Panicked(message));
                panic::resume_unwind(payload)
            }
        }
    }

    fn open_session(&self, run: &CrawlRun, cfg: CrawlerConfig) -> Session {
        let services = &self.services;
        let mut lifecycle = LifecycleMachine::new();
        let listeners = self.listeners.clone();
        let lifecycle_run_id = run.id.clone();
        lifecycle.add_listener(move |old, new| {
            listeners.emit(&CrawlEvent::StateChanged {
                run_id: lifecycle_run_id.clone(),
                old,
                new,
            });
            Ok(())
        });

        let mut executor = ActionExecutor::new(
            services.driver.clone(),
            services.clock.clone(),
            services.mail.clone(),
            ExecutorSettings::from_config(&cfg),
        );
        executor.set_target_package(Some(run.target_package.clone()));

        Session {
            run_id: run.id.clone(),
            target_package: run.target_package.clone(),
            lifecycle,
            tracker: ScreenTracker::new(services.fingerprinter.clone(), services.screens.clone()),
            stuck: StuckDetector::new(cfg.stuck_threshold),
            recovery: SessionRecoveryManager::new(
                cfg.recovery.max_attempts,
                cfg.recovery_delay(),
                services.clock.clone(),
            ),
            executor,
            history: ExplorationHistory::new(cfg.history_window),
            run_clock: RunClock::new(services.clock.now()),
            steps_attempted: 0,
            steps_completed: 0,
            elapsed_at_last_step: Duration::ZERO,
            consecutive_failures: 0,
            grounding_total: Duration::ZERO,
            grounding_samples: 0,
            cfg,
        }
    }

    fn transition(&self, session: &mut Session, target: LifecycleState) {
        if let Err(err) = session.lifecycle.transition_to(target) {
            error!(run_id = %session.run_id, %err, "lifecycle violation");
        }
    }

    fn drive(&self, session: &mut Session) -> StopReason {
        self.transition(session, LifecycleState::Initializing);
        self.emit(CrawlEvent::CrawlStarted {
            run_id: session.run_id.clone(),
            target_package: session.target_package.clone(),
        });
        if self.controller.is_stopped() {
            self.controller.start();
        }
        if let Err(err) = self.services.runs.mark_running(&session.run_id, Utc::now()) {
            return StopReason::RepositoryFailure(format!("mark run running: {err:#}"));
        }
        session.tracker.start_run(&session.run_id);
        session.run_clock = RunClock::new(self.services.clock.now());
        self.transition(session, LifecycleState::Running);
        info!(run_id = %session.run_id, package = %session.target_package, "crawl started");

        loop {
            if let Some(reason) = self.limit_reached(session) {
                return reason;
            }
            match self.controller.state() {
                ControlState::Running => {}
                ControlState::Stopped => return StopReason::OperatorStop,
                ControlState::Paused => {
                    if let Some(reason) = self.wait_out_pause(session) {
                        return reason;
                    }
                    continue;
                }
            }

            session.steps_attempted += 1;
            let step = session.steps_attempted;
            match self.run_step(session, step) {
                StepOutcome::Completed => {
                    session.steps_completed += 1;
                    session.consecutive_failures = 0;
                    session.elapsed_at_last_step =
                        session.run_clock.active_elapsed(self.services.clock.now());
                    if let Err(err) = self.services.runs.update_progress(
                        &session.run_id,
                        session.steps_completed,
                        session.distinct_screens(),
                    ) {
                        return StopReason::RepositoryFailure(format!(
                            "update run progress: {err:#}"
                        ));
                    }
                }
                StepOutcome::Failed(err) => {
                    warn!(run_id = %session.run_id, step, %err, "step failed");
                    self.emit(CrawlEvent::Error {
                        run_id: session.run_id.clone(),
                        step: Some(step),
                        error: err.clone(),
                    });
                    session.consecutive_failures += 1;
                    if session.consecutive_failures >= session.cfg.max_consecutive_step_failures {
                        return StopReason::TooManyFailures(err);
                    }
                }
                StepOutcome::Stop(reason) => return reason,
            }
        }
    }

    fn limit_reached(&self, session: &Session) -> Option<StopReason> {
        if let Some(limit) = session.cfg.step_limit()
            && session.steps_completed >= limit
        {
            return Some(StopReason::MaxSteps);
        }
        let now = self.services.clock.now();
        if !session
            .run_clock
            .within_limit(session.cfg.duration_limit(), now)
        {
            return Some(StopReason::MaxDuration);
        }
        None
    }

    /// Block until the operator resumes or stops; paused time is excluded
    /// from the duration budget.
    fn wait_out_pause(&self, session: &mut Session) -> Option<StopReason> {
        session.run_clock.begin_pause(self.services.clock.now());
        self.transition(session, LifecycleState::PausedManual);
        info!(run_id = %session.run_id, "crawl paused");

        let poll = Duration::from_millis(session.cfg.pause_poll_ms);
        let state = loop {
            let state = self.controller.wait_while_paused(poll);
            if state != ControlState::Paused {
                break state;
            }
        };
        session.run_clock.end_pause(self.services.clock.now());

        match state {
            ControlState::Stopped => Some(StopReason::OperatorStop),
            _ => {
                info!(run_id = %session.run_id, "crawl resumed");
                self.transition(session, LifecycleState::Running);
                None
            }
        }
    }

    /// Finalize a run. Consumes the session, so it runs once per run.
    fn finish(&mut self, mut session: Session, reason: StopReason) -> CrawlOutcome {
        self.stop_captures();
        let distinct_screens = session.distinct_screens();
        session.tracker.end_run();

        if reason.is_error() {
            self.transition(&mut session, LifecycleState::Error);
        } else {
            self.transition(&mut session, LifecycleState::Stopping);
            self.transition(&mut session, LifecycleState::Stopped);
            if !session.lifecycle.state().is_terminal() {
                self.transition(&mut session, LifecycleState::Error);
            }
        }

        let runs = &self.services.runs;
        if let Err(err) = runs
            .update_progress(&session.run_id, session.steps_completed, distinct_screens)
            .and_then(|()| runs.finish_run(&session.run_id, reason.run_status(), Utc::now()))
        {
            warn!(run_id = %session.run_id, err = %format!("{err:#}"), "could not finalize run");
        }
        self.controller.stop();

        let average_grounding = session.average_grounding();
        self.emit(CrawlEvent::CrawlCompleted {
            run_id: session.run_id.clone(),
            total_steps: session.steps_completed,
            duration_ms: millis(session.elapsed_at_last_step),
            reason: reason.to_string(),
            average_grounding_ms: average_grounding.map(millis),
        });
        info!(
            run_id = %session.run_id,
            steps = session.steps_completed,
            %reason,
            "crawl finished"
        );

        CrawlOutcome {
            run_id: session.run_id,
            final_state: session.lifecycle.state(),
            steps_completed: session.steps_completed,
            duration: session.elapsed_at_last_step,
            distinct_screens,
            average_grounding,
            reason,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_limits_and_operator_stops_are_normal_endings() {
        assert!(!StopReason::MaxSteps.is_error());
        assert!(!StopReason::MaxDuration.is_error());
        assert!(!StopReason::OperatorStop.is_error());
        assert!(StopReason::RecoveryExhausted("x".into()).is_error());
        assert!(StopReason::TooManyFailures("x".into()).is_error());
        assert!(StopReason::RepositoryFailure("x".into()).is_error());
        assert!(StopReason::Panicked("x".into()).is_error());
        assert_eq!(StopReason::OperatorStop.run_status(), RunStatus::Completed);
        assert_eq!(
            StopReason::Panicked("boom".into()).run_status(),
            RunStatus::Failed
        );
    }

    #[test]
    fn reasons_render_their_cause() {
        assert_eq!(StopReason::MaxSteps.to_string(), "max steps reached");
        assert_eq!(
            StopReason::RepositoryFailure("record step: disk full".into()).to_string(),
            "repository failure: record step: disk full"
        );
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload = panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }
}
