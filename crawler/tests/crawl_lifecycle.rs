//! Loop-level scenarios for a whole run: event order, termination reasons,
//! operator control, stuck detection and the single terminal event.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::json;

use crawler::core::types::{ControlState, CrawlRun, LifecycleState, RunStatus, StepRecord};
use crawler::crawl_loop::StopReason;
use crawler::events::CrawlEvent;
use crawler::io::capture::AuxiliaryCapture;
use crawler::io::fingerprint::PerceptualHasher;
use crawler::io::store::{RunStore, StepStore};
use crawler::test_support::{
    DEVICE_ID, OracleReply, RUN_ID, ScriptedOracle, SpyCapture, TARGET_PACKAGE, TestCrawl,
    actions, back_action, click_label, literal_screen, solid_png,
};

fn click(label: &str) -> OracleReply {
    OracleReply::Json(actions(vec![click_label(label)]))
}

fn final_states(events: &[CrawlEvent]) -> Vec<LifecycleState> {
    events
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::StateChanged { new, .. } => Some(*new),
            _ => None,
        })
        .collect()
}

fn completed(events: &[CrawlEvent]) -> Vec<(u32, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::CrawlCompleted {
                total_steps,
                reason,
                ..
            } => Some((*total_steps, reason.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn single_step_emits_events_in_order() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 1;

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(outcome.final_state, LifecycleState::Stopped);
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(
        harness.sink.names(),
        vec![
            "state_changed",
            "crawl_started",
            "state_changed",
            "step_started",
            "screenshot_captured",
            "ai_request_sent",
            "ai_response_received",
            "action_executed",
            "screen_processed",
            "step_completed",
            "state_changed",
            "state_changed",
            "crawl_completed",
        ]
    );
    assert_eq!(
        final_states(&harness.sink.events()),
        vec![
            LifecycleState::Initializing,
            LifecycleState::Running,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ]
    );
    assert!(harness.sink.events().iter().all(|e| e.run_id() == RUN_ID));
}

#[test]
fn max_steps_ends_run_and_persists_progress() {
    let harness = TestCrawl::new(vec![click("1")]).expect("harness");

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.steps_completed, 3);
    assert_eq!(harness.sink.count("step_completed"), 3);
    assert_eq!(
        completed(&harness.sink.events()),
        vec![(3, "max steps reached".to_string())]
    );

    let run = harness.store.get_run(RUN_ID).expect("run row");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_count, 3);
    assert_eq!(run.screen_count, 1);
    assert!(run.started_at.is_some() && run.ended_at.is_some());

    let steps = harness.store.steps(RUN_ID).expect("steps");
    assert_eq!(steps.iter().map(|s| s.step).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(harness.artifacts.path().join(RUN_ID).join("step-3.png").is_file());
    assert_eq!(harness.capture.stops(), 1);
    assert_eq!(harness.controller.state(), ControlState::Stopped);
}

#[test]
fn duration_limit_uses_time_up_to_last_step() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 0;
    harness.config.max_duration_secs = 60;
    let clock = harness.clock.clone();
    harness.on_step_completed(move |_| clock.advance(Duration::from_secs(40)));

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxDuration);
    assert_eq!(outcome.steps_completed, 2);
    assert_eq!(outcome.duration, Duration::from_secs(80));
    let duration_ms = harness.sink.events().iter().find_map(|event| match event {
        CrawlEvent::CrawlCompleted { duration_ms, .. } => Some(*duration_ms),
        _ => None,
    });
    assert_eq!(duration_ms, Some(80_000));
}

#[test]
fn operator_stop_ends_run_at_next_boundary() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 10;
    let controller = harness.controller.clone();
    harness.on_step_completed(move |step| {
        if step == 2 {
            controller.stop();
        }
    });

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::OperatorStop);
    assert_eq!(outcome.steps_completed, 2);
    assert_eq!(outcome.final_state, LifecycleState::Stopped);
    assert_eq!(
        completed(&harness.sink.events()),
        vec![(2, "stopped by operator".to_string())]
    );
}

#[test]
fn paused_time_does_not_count_against_duration() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 3;
    harness.config.max_duration_secs = 60;

    let controller = harness.controller.clone();
    let clock = harness.clock.clone();
    let sink = harness.sink.clone();
    harness.on_step_completed(move |step| {
        if step != 1 {
            return;
        }
        controller.pause();
        let controller = controller.clone();
        let clock = clock.clone();
        let sink = sink.clone();
        thread::spawn(move || {
            let paused = sink.wait_for(Duration::from_secs(5), |event| {
                matches!(
                    event,
                    CrawlEvent::StateChanged {
                        new: LifecycleState::PausedManual,
                        ..
                    }
                )
            });
            clock.advance(Duration::from_secs(600));
            if paused {
                controller.resume();
            } else {
                controller.stop();
            }
        });
    });

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(outcome.steps_completed, 3);
    assert!(outcome.duration < Duration::from_secs(60));
    let states = final_states(&harness.sink.events());
    assert!(states.windows(2).any(|pair| pair
        == [LifecycleState::PausedManual, LifecycleState::Running]));
}

#[test]
fn stop_while_paused_finishes_cleanly() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 10;
    let controller = harness.controller.clone();
    let sink = harness.sink.clone();
    harness.on_step_completed(move |step| {
        if step == 1 {
            controller.pause();
            let controller = controller.clone();
            let sink = sink.clone();
            thread::spawn(move || {
                sink.wait_for(Duration::from_secs(5), |event| {
                    matches!(
                        event,
                        CrawlEvent::StateChanged {
                            new: LifecycleState::PausedManual,
                            ..
                        }
                    )
                });
                controller.stop();
            });
        }
    });

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::OperatorStop);
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(
        final_states(&harness.sink.events()),
        vec![
            LifecycleState::Initializing,
            LifecycleState::Running,
            LifecycleState::PausedManual,
            LifecycleState::Stopping,
            LifecycleState::Stopped,
        ]
    );
}

#[test]
fn config_changes_apply_to_the_next_run() {
    let harness = TestCrawl::new(vec![click("1")]).expect("harness");
    let mut crawl = harness.build().expect("loop");
    crawl
        .config()
        .update(|cfg| cfg.max_steps = 2)
        .expect("update");

    let outcome = crawl.run(RUN_ID).expect("run");
    assert_eq!(outcome.steps_completed, 2);

    assert!(crawl.config().update(|cfg| cfg.action_delay_ms = 10).is_err());
    assert_eq!(crawl.config().snapshot().expect("snapshot").action_delay_ms, 500);
}

#[test]
fn unknown_run_is_rejected_before_any_event() {
    let harness = TestCrawl::new(vec![click("1")]).expect("harness");
    let err = harness.build().expect("loop").run("missing").unwrap_err();
    assert!(format!("{err:#}").contains("missing"));
    assert!(harness.sink.events().is_empty());
    assert_eq!(harness.capture.stops(), 0);
}

#[test]
fn panic_in_step_still_finishes_once() {
    let mut harness = TestCrawl::new(vec![
        click("1"),
        OracleReply::Panic("oracle exploded".to_string()),
    ])
    .expect("harness");
    harness.config.max_steps = 5;

    let result = panic::catch_unwind(AssertUnwindSafe(|| harness.run()));

    assert!(result.is_err(), "panic must reach the caller");
    assert_eq!(
        completed(&harness.sink.events()),
        vec![(1, "panicked: oracle exploded".to_string())]
    );
    assert_eq!(
        final_states(&harness.sink.events()).last(),
        Some(&LifecycleState::Error)
    );
    assert_eq!(harness.capture.stops(), 1);
    assert_eq!(
        harness.store.get_run(RUN_ID).expect("run").status,
        RunStatus::Failed
    );
}

#[test]
fn oracle_failures_end_run_after_consecutive_step_failures() {
    let mut harness =
        TestCrawl::new(vec![OracleReply::Fail("model overloaded".to_string())]).expect("harness");
    harness.config.oracle_max_retries = 1;
    harness.config.max_consecutive_step_failures = 2;

    let outcome = harness.run().expect("run");

    assert_eq!(harness.oracle.calls(), 4);
    assert_eq!(harness.sink.count("error"), 2);
    assert_eq!(harness.sink.count("step_completed"), 0);
    assert_eq!(outcome.final_state, LifecycleState::Error);
    match &outcome.reason {
        StopReason::TooManyFailures(err) => {
            assert!(err.contains("after 2 attempts"), "{err}");
            assert!(err.contains("model overloaded"), "{err}");
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[test]
fn rejected_response_is_fed_back_on_retry() {
    let mut harness = TestCrawl::new(vec![
        OracleReply::Json(json!({ "actions": [] })),
        click("1"),
    ])
    .expect("harness");
    harness.config.max_steps = 1;

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.steps_completed, 1);
    let contexts = harness.oracle.contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[1].attempt, 2);
    let feedback = contexts[1].previous_error.clone().unwrap_or_default();
    assert!(feedback.contains("schema"), "{feedback}");
    assert_eq!(harness.sink.count("ai_request_sent"), 2);
    assert_eq!(harness.sink.count("ai_response_received"), 2);
}

#[test]
fn unknown_label_counts_as_invalid_response() {
    let mut harness = TestCrawl::new(vec![click("99")]).expect("harness");
    harness.config.max_steps = 1;
    harness.config.oracle_max_retries = 0;
    harness.config.max_consecutive_step_failures = 1;

    let outcome = harness.run().expect("run");

    assert!(matches!(outcome.reason, StopReason::TooManyFailures(ref err) if err.contains("'99'")));
    assert_eq!(harness.driver.taps(), 0);
}

#[test]
fn stuck_flag_reaches_oracle_after_threshold_and_clears_on_escape() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 6;
    for _ in 0..4 {
        harness.driver.push_screen(literal_screen("00000000000000ff"));
    }
    harness.driver.push_screen(literal_screen("ffffffffffff0000"));

    harness.run().expect("run");

    let stuck: Vec<bool> = harness.oracle.contexts().iter().map(|c| c.stuck).collect();
    assert_eq!(stuck, vec![false, false, false, false, true, false]);
    let reason = harness.oracle.contexts()[4].stuck_reason.clone().unwrap_or_default();
    assert!(reason.contains("4 times"), "{reason}");

    let records = harness.store.steps(RUN_ID).expect("steps");
    assert!(records[3].stuck);
    assert!(!records[4].stuck);
}

#[test]
fn near_duplicate_screens_share_an_id_across_runs() {
    let mut harness = TestCrawl::new(vec![OracleReply::Json(actions(vec![back_action()]))])
        .expect("harness");
    harness.config.max_steps = 2;
    harness.driver.push_screen(literal_screen("0000000000000000"));
    harness.driver.push_screen(literal_screen("0000000000000003"));

    let outcome = harness.run().expect("first run");
    assert_eq!(outcome.distinct_screens, 1);

    harness
        .store
        .insert_run(CrawlRun::pending("run-2", DEVICE_ID, TARGET_PACKAGE))
        .expect("second run");
    let outcome = harness.build().expect("loop").run("run-2").expect("second run");
    assert_eq!(outcome.distinct_screens, 1);

    let observations: Vec<(String, bool)> = harness
        .sink
        .events()
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::ScreenProcessed {
                run_id,
                observation,
                ..
            } => Some((run_id.clone(), observation.is_new)),
            _ => None,
        })
        .collect();
    assert_eq!(
        observations,
        vec![
            (RUN_ID.to_string(), true),
            (RUN_ID.to_string(), false),
            ("run-2".to_string(), false),
            ("run-2".to_string(), false),
        ]
    );
    assert_eq!(harness.store.screens().expect("screens").len(), 1);
}

#[test]
fn navigating_away_cuts_the_batch_and_relaunches() {
    let mut harness = TestCrawl::new(vec![OracleReply::Json(actions(vec![
        click_label("1"),
        click_label("2"),
    ]))])
    .expect("harness");
    harness.config.max_steps = 2;
    harness.driver.leave_app_on_next_gesture("com.android.chrome");

    harness.run().expect("run");

    let first_step: Vec<bool> = harness
        .sink
        .events()
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::ActionExecuted { step: 1, result, .. } => Some(result.navigated_away),
            _ => None,
        })
        .collect();
    assert_eq!(first_step, vec![true]);
    assert!(
        harness
            .driver
            .calls()
            .contains(&crawler::test_support::DriverCall::LaunchApp(
                TARGET_PACKAGE.to_string()
            ))
    );
    assert_eq!(harness.sink.count("step_completed"), 2);
}

#[test]
fn heartbeat_reports_waiting_between_request_and_response() {
    let oracle = ScriptedOracle::new(vec![click("1")]).with_delay(Duration::from_millis(120));
    let mut harness = TestCrawl::with_oracle(oracle).expect("harness");
    harness.config.max_steps = 1;
    harness.config.heartbeat_interval_ms = 10;

    harness.run().expect("run");

    let names = harness.sink.names();
    let request = names.iter().position(|n| *n == "ai_request_sent").expect("request");
    let response = names
        .iter()
        .position(|n| *n == "ai_response_received")
        .expect("response");
    let waiting: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == "ai_waiting")
        .map(|(i, _)| i)
        .collect();
    assert!(!waiting.is_empty());
    assert!(waiting.iter().all(|i| *i > request && *i < response));
}

struct BrokenSteps;

impl StepStore for BrokenSteps {
    fn record_step(&self, _record: &StepRecord) -> Result<()> {
        Err(anyhow!("disk full"))
    }
}

#[test]
fn repository_failure_ends_run_in_error() {
    let harness = TestCrawl::new(vec![click("1")]).expect("harness");
    let mut services = harness.services();
    services.steps = Arc::new(BrokenSteps);

    let outcome = harness
        .build_with(services)
        .expect("loop")
        .run(RUN_ID)
        .expect("run");

    assert_eq!(outcome.final_state, LifecycleState::Error);
    assert_eq!(outcome.steps_completed, 0);
    assert_eq!(
        outcome.reason,
        StopReason::RepositoryFailure("record step 1: disk full".to_string())
    );
    assert_eq!(harness.sink.count("step_completed"), 0);
    assert_eq!(harness.sink.count("crawl_completed"), 1);
    assert_eq!(
        harness.store.get_run(RUN_ID).expect("run").status,
        RunStatus::Failed
    );
}

#[test]
fn grounding_failure_fails_the_step_not_the_loop() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_consecutive_step_failures = 2;
    harness.grounding.fail_with("overlay service unavailable");

    let outcome = harness.run().expect("run");

    assert_eq!(harness.grounding.processed().len(), 2);
    assert_eq!(harness.oracle.calls(), 0);
    assert!(matches!(
        outcome.reason,
        StopReason::TooManyFailures(ref err) if err.contains("overlay service unavailable")
    ));
    let errors: Vec<Option<u32>> = harness
        .sink
        .events()
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::Error { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![Some(1), Some(2)]);
}

#[test]
fn failing_capture_does_not_block_completion() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 1;
    let capture = SpyCapture::failing("video");
    let mut services = harness.services();
    services.captures.insert(0, Box::new(capture.clone()));

    let outcome = harness
        .build_with(services)
        .expect("loop")
        .run(RUN_ID)
        .expect("run");

    assert_eq!(outcome.final_state, LifecycleState::Stopped);
    assert_eq!(capture.stops(), 1);
    assert_eq!(harness.capture.stops(), 1);
    assert_eq!(harness.sink.count("crawl_completed"), 1);
}

struct ExplodingCapture;

impl AuxiliaryCapture for ExplodingCapture {
    fn name(&self) -> &str {
        "exploding"
    }

    fn stop(&mut self) -> Result<()> {
        panic!("capture flush crashed");
    }
}

#[test]
fn panicking_capture_does_not_skip_cleanup() {
    let mut harness = TestCrawl::new(vec![click("1")]).expect("harness");
    harness.config.max_steps = 1;
    let mut services = harness.services();
    services.captures.insert(0, Box::new(ExplodingCapture));

    let outcome = harness
        .build_with(services)
        .expect("loop")
        .run(RUN_ID)
        .expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(outcome.final_state, LifecycleState::Stopped);
    assert_eq!(harness.capture.stops(), 1);
    assert_eq!(
        completed(&harness.sink.events()),
        vec![(1, "max steps reached".to_string())]
    );
    assert_eq!(
        final_states(&harness.sink.events()).last(),
        Some(&LifecycleState::Stopped)
    );
    assert_eq!(harness.controller.state(), ControlState::Stopped);
    assert_eq!(
        harness.store.get_run(RUN_ID).expect("run row").status,
        RunStatus::Completed
    );
}

#[test]
fn perceptual_hashes_deduplicate_real_screenshots() {
    let mut harness = TestCrawl::new(vec![OracleReply::Json(actions(vec![back_action()]))])
        .expect("harness");
    harness.config.max_steps = 2;
    let png = solid_png(64, 128, 200).expect("png");
    harness.driver.push_screen(png.clone());
    let mut services = harness.services();
    services.fingerprinter = Arc::new(PerceptualHasher::new());

    let outcome = harness
        .build_with(services)
        .expect("loop")
        .run(RUN_ID)
        .expect("run");

    assert_eq!(outcome.distinct_screens, 1);
    let saved = std::fs::read(harness.artifacts.path().join(RUN_ID).join("step-1.png"))
        .expect("screenshot");
    assert_eq!(saved, png);
    let screens = harness.store.screens().expect("screens");
    assert_eq!(screens.len(), 1);
    assert_eq!(screens[0].fingerprint.len(), 16);
}
