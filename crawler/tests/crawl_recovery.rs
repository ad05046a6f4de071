//! Session-crash recovery inside a running crawl.

use std::time::Duration;

use crawler::core::types::{LifecycleState, RunStatus};
use crawler::crawl_loop::StopReason;
use crawler::events::CrawlEvent;
use crawler::io::store::RunStore;
use crawler::test_support::{
    CRASH_MESSAGE, DriverCall, OracleReply, RUN_ID, TestCrawl, actions, click_label, scroll_down,
};

fn harness(max_steps: u32) -> TestCrawl {
    let mut harness = TestCrawl::new(vec![OracleReply::Json(actions(vec![click_label("1")]))])
        .expect("harness");
    harness.config.max_steps = max_steps;
    harness
}

fn recovery_completions(events: &[CrawlEvent]) -> Vec<(u32, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::RecoveryCompleted {
                attempt, success, ..
            } => Some((*attempt, *success)),
            _ => None,
        })
        .collect()
}

fn action_successes(events: &[CrawlEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::ActionExecuted { result, .. } => Some(result.success),
            _ => None,
        })
        .collect()
}

#[test]
fn crash_then_successful_recovery_reruns_the_action() {
    let harness = harness(1);
    harness.driver.fail_next_gesture(CRASH_MESSAGE);

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(harness.sink.count("recovery_started"), 1);
    assert_eq!(recovery_completions(&harness.sink.events()), vec![(1, true)]);
    assert_eq!(action_successes(&harness.sink.events()), vec![true]);
    assert_eq!(harness.driver.restart_count(), 1);
    assert_eq!(harness.driver.taps(), 2);

    let names = harness.sink.names();
    let position = |name: &str| names.iter().position(|n| *n == name).expect(name);
    assert!(position("recovery_started") < position("recovery_completed"));
    assert!(position("recovery_completed") < position("action_executed"));
    assert!(
        harness
            .driver
            .calls()
            .contains(&DriverCall::RestartSession(Duration::ZERO))
    );
}

#[test]
fn persistent_crash_exhausts_recovery_and_fails_the_run() {
    let harness = harness(3);
    harness.driver.fail_all_gestures(CRASH_MESSAGE);

    let outcome = harness.run().expect("run");

    assert_eq!(harness.driver.restart_count(), 3);
    assert_eq!(harness.sink.count("recovery_started"), 3);
    assert_eq!(
        recovery_completions(&harness.sink.events()),
        vec![(1, true), (2, true), (3, true)]
    );
    let exhausted: Vec<u32> = harness
        .sink
        .events()
        .iter()
        .filter_map(|event| match event {
            CrawlEvent::RecoveryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .collect();
    assert_eq!(exhausted, vec![3]);
    assert_eq!(action_successes(&harness.sink.events()), vec![false]);
    assert_eq!(harness.sink.count("step_completed"), 0);

    assert_eq!(outcome.final_state, LifecycleState::Error);
    assert!(matches!(
        outcome.reason,
        StopReason::RecoveryExhausted(ref err) if err.contains("instrumentation")
    ));
    assert_eq!(harness.sink.count("crawl_completed"), 1);
    assert_eq!(harness.capture.stops(), 1);
    assert_eq!(
        harness.store.get_run(RUN_ID).expect("run").status,
        RunStatus::Failed
    );
}

#[test]
fn failed_restart_consumes_an_attempt() {
    let harness = harness(1);
    harness.driver.fail_next_gesture(CRASH_MESSAGE);
    harness.driver.fail_next_restart("adb: device offline");

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(
        recovery_completions(&harness.sink.events()),
        vec![(1, false), (2, true)]
    );
    assert_eq!(harness.driver.restart_count(), 2);
    assert_eq!(action_successes(&harness.sink.events()), vec![true]);
}

#[test]
fn ordinary_action_failure_does_not_restart() {
    let mut harness = TestCrawl::new(vec![OracleReply::Json(actions(vec![
        click_label("1"),
        scroll_down(),
    ]))])
    .expect("harness");
    harness.config.max_steps = 1;
    harness.driver.fail_next_gesture("element is not clickable");

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(harness.driver.restart_count(), 0);
    assert_eq!(harness.sink.count("recovery_started"), 0);
    assert_eq!(action_successes(&harness.sink.events()), vec![false]);
    assert!(
        !harness
            .driver
            .calls()
            .iter()
            .any(|call| matches!(call, DriverCall::Swipe(..)))
    );
}

#[test]
fn screenshot_crash_is_recovered() {
    let harness = harness(1);
    harness.driver.fail_next_screenshot(CRASH_MESSAGE);

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(harness.driver.restart_count(), 1);
    assert_eq!(harness.driver.screenshot_count(), 2);
    let names = harness.sink.names();
    let position = |name: &str| names.iter().position(|n| *n == name).expect(name);
    assert!(position("recovery_completed") < position("screenshot_captured"));
}

#[test]
fn recovery_budget_resets_every_step() {
    let mut harness = harness(2);
    harness.config.recovery.max_attempts = 1;
    harness.driver.fail_next_gesture(CRASH_MESSAGE);
    let driver = harness.driver.clone();
    harness.on_step_completed(move |step| {
        if step == 1 {
            driver.fail_next_gesture(CRASH_MESSAGE);
        }
    });

    let outcome = harness.run().expect("run");

    assert_eq!(outcome.reason, StopReason::MaxSteps);
    assert_eq!(outcome.steps_completed, 2);
    assert_eq!(harness.driver.restart_count(), 2);
    assert_eq!(harness.sink.count("recovery_exhausted"), 0);
}
