//! Scripted collaborators and fixtures for deterministic crawl tests.
//!
//! Screens are "literal": the screenshot bytes are the fingerprint text, so
//! [`LiteralFingerprinter`] lets tests choose exact and near-duplicate screens
//! without decoding images. [`ScriptedDriver`] records every state-changing
//! call; queries (package, screenshot, size) are not recorded.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use image::{ImageFormat, Luma};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::control::RunController;
use crate::core::types::{BoundingBox, CrawlRun, Point, ScreenSize};
use crate::crawl_loop::{CrawlLoop, CrawlOutcome, CrawlServices};
use crate::events::{CrawlEvent, CrawlListener, ListenerSet};
use crate::io::capture::AuxiliaryCapture;
use crate::io::clock::Clock;
use crate::io::config::{CrawlerConfig, SharedConfig};
use crate::io::driver::DeviceDriver;
use crate::io::fingerprint::Fingerprinter;
use crate::io::grounding::{GroundedElement, Grounding, GroundingResult};
use crate::io::mail::{MailClient, MailMessage};
use crate::io::oracle::{Oracle, OracleContext};
use crate::io::store::MemoryStore;

pub const TARGET_PACKAGE: &str = "com.example.app";
pub const RUN_ID: &str = "run-1";
pub const DEVICE_ID: &str = "emulator-5554";
/// Error text the crash classifier recognizes.
pub const CRASH_MESSAGE: &str = "instrumentation process is not running (probably crashed)";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Screens

/// Fingerprints screenshot bytes by reading them as the fingerprint itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralFingerprinter;

impl Fingerprinter for LiteralFingerprinter {
    fn fingerprint(&self, png: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(png).context("literal screen is not utf-8")?;
        let text = text.trim().to_ascii_lowercase();
        if text.is_empty() || !text.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("literal screen {text:?} is not a hex fingerprint");
        }
        Ok(text)
    }
}

/// Screenshot bytes that [`LiteralFingerprinter`] maps to `fingerprint`.
pub fn literal_screen(fingerprint: &str) -> Vec<u8> {
    fingerprint.as_bytes().to_vec()
}

/// A real single-color grayscale PNG.
pub fn solid_png(width: u32, height: u32, luma: u8) -> Result<Vec<u8>> {
    let img = image::ImageBuffer::from_pixel(width, height, Luma([luma]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .context("encode solid png")?;
    Ok(out.into_inner())
}

// ---------------------------------------------------------------------------
// Clock

/// Clock that only moves when told to; sleeps advance it and are recorded.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *lock(&self.offset)
    }

    fn sleep(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
        self.advance(duration);
    }
}

// ---------------------------------------------------------------------------
// Driver

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    PressBack,
    LaunchApp(String),
    Tap(Point),
    LongPress(Point, Duration),
    Swipe(Point, Point, Duration),
    TypeText(String),
    DismissKeyboard,
    OpenUrl(String),
    RestartSession(Duration),
}

#[derive(Debug)]
struct DriverState {
    foreground: String,
    activity: Option<String>,
    back_stack: Vec<String>,
    screens: VecDeque<Vec<u8>>,
    screenshot_failures: VecDeque<String>,
    screenshots: u32,
    gesture_failures: VecDeque<String>,
    persistent_gesture_failure: Option<String>,
    leave_app_to: Option<String>,
    restart_failures: VecDeque<String>,
    restarts: u32,
    ignore_launches: bool,
    calls: Vec<DriverCall>,
}

/// In-memory device with a scripted foreground app and screenshot queue.
///
/// The screenshot queue repeats its last entry once drained; an empty queue
/// yields an all-zero fingerprint.
#[derive(Debug)]
pub struct ScriptedDriver {
    state: Mutex<DriverState>,
}

impl ScriptedDriver {
    pub fn new(package: &str) -> Self {
        Self {
            state: Mutex::new(DriverState {
                foreground: package.to_string(),
                activity: Some(format!("{package}/.MainActivity")),
                back_stack: Vec::new(),
                screens: VecDeque::new(),
                screenshot_failures: VecDeque::new(),
                screenshots: 0,
                gesture_failures: VecDeque::new(),
                persistent_gesture_failure: None,
                leave_app_to: None,
                restart_failures: VecDeque::new(),
                restarts: 0,
                ignore_launches: false,
                calls: Vec::new(),
            }),
        }
    }

    pub fn push_screen(&self, png: Vec<u8>) {
        lock(&self.state).screens.push_back(png);
    }

    pub fn set_foreground(&self, package: &str) {
        lock(&self.state).foreground = package.to_string();
    }

    /// Package that the next back press returns to.
    pub fn push_back_stack(&self, package: &str) {
        lock(&self.state).back_stack.push(package.to_string());
    }

    pub fn ignore_launches(&self) {
        lock(&self.state).ignore_launches = true;
    }

    pub fn fail_next_gesture(&self, message: &str) {
        lock(&self.state).gesture_failures.push_back(message.to_string());
    }

    pub fn fail_all_gestures(&self, message: &str) {
        lock(&self.state).persistent_gesture_failure = Some(message.to_string());
    }

    pub fn fail_next_screenshot(&self, message: &str) {
        lock(&self.state).screenshot_failures.push_back(message.to_string());
    }

    pub fn fail_next_restart(&self, message: &str) {
        lock(&self.state).restart_failures.push_back(message.to_string());
    }

    /// The next successful gesture moves the device to `package`.
    pub fn leave_app_on_next_gesture(&self, package: &str) {
        lock(&self.state).leave_app_to = Some(package.to_string());
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.state).calls.clone()
    }

    pub fn taps(&self) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Tap(_)))
            .count()
    }

    pub fn restart_count(&self) -> u32 {
        lock(&self.state).restarts
    }

    pub fn screenshot_count(&self) -> u32 {
        lock(&self.state).screenshots
    }

    fn gesture(&self, call: DriverCall) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(message) = state.gesture_failures.pop_front() {
            return Err(anyhow!(message));
        }
        if let Some(message) = &state.persistent_gesture_failure {
            return Err(anyhow!(message.clone()));
        }
        if let Some(package) = state.leave_app_to.take() {
            state.foreground = package;
        }
        Ok(())
    }
}

impl DeviceDriver for ScriptedDriver {
    fn device_id(&self) -> String {
        DEVICE_ID.to_string()
    }

    fn current_package(&self) -> Result<String> {
        Ok(lock(&self.state).foreground.clone())
    }

    fn current_activity(&self) -> Result<Option<String>> {
        Ok(lock(&self.state).activity.clone())
    }

    fn press_back(&self) -> Result<()> {
        self.gesture(DriverCall::PressBack)?;
        let mut state = lock(&self.state);
        if let Some(previous) = state.back_stack.pop() {
            state.foreground = previous;
        }
        Ok(())
    }

    fn launch_app(&self, package: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::LaunchApp(package.to_string()));
        if !state.ignore_launches {
            state.foreground = package.to_string();
        }
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        state.screenshots += 1;
        if let Some(message) = state.screenshot_failures.pop_front() {
            return Err(anyhow!(message));
        }
        let png = if state.screens.len() > 1 {
            state.screens.pop_front()
        } else {
            state.screens.front().cloned()
        };
        Ok(png.unwrap_or_else(|| literal_screen("0000000000000000")))
    }

    fn screen_size(&self) -> Result<ScreenSize> {
        Ok(ScreenSize {
            width: 1080,
            height: 2400,
        })
    }

    fn tap(&self, at: Point) -> Result<()> {
        self.gesture(DriverCall::Tap(at))
    }

    fn long_press(&self, at: Point, hold: Duration) -> Result<()> {
        self.gesture(DriverCall::LongPress(at, hold))
    }

    fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<()> {
        self.gesture(DriverCall::Swipe(from, to, duration))
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.gesture(DriverCall::TypeText(text.to_string()))
    }

    fn dismiss_keyboard(&self) -> Result<()> {
        self.gesture(DriverCall::DismissKeyboard)
    }

    fn open_url(&self, url: &str) -> Result<()> {
        self.gesture(DriverCall::OpenUrl(url.to_string()))
    }

    fn restart_session(&self, settle: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::RestartSession(settle));
        state.restarts += 1;
        match state.restart_failures.pop_front() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle

#[derive(Debug, Clone)]
pub enum OracleReply {
    Json(Value),
    Fail(String),
    Panic(String),
}

/// Replays scripted replies; the last reply repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<OracleReply>>,
    last: Mutex<Option<OracleReply>>,
    contexts: Mutex<Vec<OracleContext>>,
    delay: Duration,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<OracleReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            contexts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Block for `delay` of real time before each reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn contexts(&self) -> Vec<OracleContext> {
        lock(&self.contexts).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.contexts).len()
    }
}

impl Oracle for ScriptedOracle {
    fn next_actions(&self, context: &OracleContext) -> Result<Value> {
        lock(&self.contexts).push(context.clone());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let reply = {
            let mut last = lock(&self.last);
            if let Some(next) = lock(&self.replies).pop_front() {
                *last = Some(next);
            }
            last.clone()
        };
        match reply {
            Some(OracleReply::Json(value)) => Ok(value),
            Some(OracleReply::Fail(message)) => Err(anyhow!(message)),
            Some(OracleReply::Panic(message)) => panic!("{message}"),
            None => Err(anyhow!("scripted oracle has no replies")),
        }
    }
}

/// Oracle response wrapping `actions`.
pub fn actions(actions: Vec<Value>) -> Value {
    json!({ "actions": actions })
}

pub fn click_label(label: &str) -> Value {
    json!({
        "action": "click",
        "target_label": label,
        "reasoning": format!("open {label}"),
    })
}

pub fn back_action() -> Value {
    json!({ "action": "back", "reasoning": "go back" })
}

pub fn scroll_down() -> Value {
    json!({ "action": "scroll_down", "reasoning": "see more" })
}

// ---------------------------------------------------------------------------
// Grounding, mail, captures

/// Returns the same grounding for every screenshot and remembers the paths.
#[derive(Debug)]
pub struct StaticGrounding {
    result: GroundingResult,
    processed: Mutex<Vec<PathBuf>>,
    failure: Mutex<Option<String>>,
}

impl StaticGrounding {
    pub fn new(result: GroundingResult) -> Self {
        Self {
            result,
            processed: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// One labeled element per `(label, bounds)` pair.
    pub fn with_labels(labels: &[(&str, BoundingBox)]) -> Self {
        let elements = labels
            .iter()
            .map(|(label, bounds)| GroundedElement {
                label: (*label).to_string(),
                text: None,
                bounds: *bounds,
            })
            .collect();
        Self::new(GroundingResult::from_elements(elements, None))
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    pub fn processed(&self) -> Vec<PathBuf> {
        lock(&self.processed).clone()
    }
}

impl Grounding for StaticGrounding {
    fn process(&self, screenshot: &Path) -> Result<GroundingResult> {
        lock(&self.processed).push(screenshot.to_path_buf());
        if let Some(message) = lock(&self.failure).clone() {
            return Err(anyhow!(message));
        }
        Ok(self.result.clone())
    }
}

/// Mailbox whose latest message is the last one pushed.
#[derive(Debug, Default)]
pub struct ScriptedMail {
    messages: Mutex<Vec<MailMessage>>,
}

impl ScriptedMail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: MailMessage) {
        lock(&self.messages).push(message);
    }
}

impl MailClient for ScriptedMail {
    fn latest_message(&self) -> Result<Option<MailMessage>> {
        Ok(lock(&self.messages).last().cloned())
    }
}

/// Capture that counts how often it was stopped.
#[derive(Debug, Clone)]
pub struct SpyCapture {
    name: String,
    stops: Arc<AtomicU32>,
    fail: bool,
}

impl SpyCapture {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stops: Arc::new(AtomicU32::new(0)),
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AuxiliaryCapture for SpyCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("{} capture did not flush", self.name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events

/// Collects every event; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<CrawlEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CrawlEvent> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(CrawlEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    pub fn listener(&self) -> Arc<dyn CrawlListener> {
        Arc::new(self.clone())
    }

    /// Poll until an event matches `pred` or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&CrawlEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if lock(&self.events).iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Calls `hook(step)` from `step_completed`, on the loop thread.
pub struct StepHook<F> {
    hook: F,
}

impl<F> StepHook<F>
where
    F: Fn(u32) + Send + Sync,
{
    pub fn new(hook: F) -> Self {
        Self { hook }
    }
}

impl<F> CrawlListener for StepHook<F>
where
    F: Fn(u32) + Send + Sync,
{
    fn step_completed(
        &self,
        _run_id: &str,
        step: u32,
        _action_count: usize,
        _duration: Duration,
    ) -> Result<()> {
        (self.hook)(step);
        Ok(())
    }
}

impl CrawlListener for RecordingSink {
    fn on_event(&self, event: &CrawlEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

/// Valid config with short waits and artifacts under `artifacts_dir`.
///
/// Pacing stays at its minimum; with [`ManualClock`] it costs no real time.
pub fn test_config(artifacts_dir: &Path) -> CrawlerConfig {
    let mut cfg = CrawlerConfig {
        max_steps: 3,
        pause_poll_ms: 10,
        artifacts_dir: artifacts_dir.to_path_buf(),
        ..CrawlerConfig::default()
    };
    cfg.recovery.delay_ms = 0;
    cfg.foreground.settle_ms = 0;
    cfg
}

/// A fully scripted crawl: one pending run, in-memory store, temp artifacts.
pub struct TestCrawl {
    pub artifacts: TempDir,
    pub driver: Arc<ScriptedDriver>,
    pub oracle: Arc<ScriptedOracle>,
    pub grounding: Arc<StaticGrounding>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub mail: Arc<ScriptedMail>,
    pub capture: SpyCapture,
    pub sink: RecordingSink,
    pub controller: Arc<RunController>,
    pub config: CrawlerConfig,
    /// Registered after the recording sink.
    pub listeners: Vec<Arc<dyn CrawlListener>>,
}

impl TestCrawl {
    pub fn new(replies: Vec<OracleReply>) -> Result<Self> {
        Self::with_oracle(ScriptedOracle::new(replies))
    }

    pub fn with_oracle(oracle: ScriptedOracle) -> Result<Self> {
        let artifacts = tempfile::tempdir().context("create artifacts dir")?;
        let config = test_config(artifacts.path());
        let store = Arc::new(MemoryStore::new());
        store.insert_run(CrawlRun::pending(RUN_ID, DEVICE_ID, TARGET_PACKAGE))?;
        Ok(Self {
            artifacts,
            driver: Arc::new(ScriptedDriver::new(TARGET_PACKAGE)),
            oracle: Arc::new(oracle),
            grounding: Arc::new(StaticGrounding::with_labels(&[
                ("1", BoundingBox::new(100, 200, 300, 260)),
                ("2", BoundingBox::new(100, 400, 980, 520)),
            ])),
            store,
            clock: Arc::new(ManualClock::new()),
            mail: Arc::new(ScriptedMail::new()),
            capture: SpyCapture::new("traffic"),
            sink: RecordingSink::new(),
            controller: Arc::new(RunController::new()),
            config,
            listeners: Vec::new(),
        })
    }

    pub fn services(&self) -> CrawlServices {
        CrawlServices {
            driver: self.driver.clone(),
            oracle: self.oracle.clone(),
            grounding: self.grounding.clone(),
            runs: self.store.clone(),
            screens: self.store.clone(),
            steps: self.store.clone(),
            fingerprinter: Arc::new(LiteralFingerprinter),
            clock: self.clock.clone(),
            mail: Some(self.mail.clone() as Arc<dyn MailClient>),
            captures: vec![Box::new(self.capture.clone()) as Box<dyn AuxiliaryCapture>],
        }
    }

    pub fn build(&self) -> Result<CrawlLoop> {
        self.build_with(self.services())
    }

    pub fn build_with(&self, services: CrawlServices) -> Result<CrawlLoop> {
        let mut listeners = ListenerSet::new();
        listeners.add(self.sink.listener());
        for listener in &self.listeners {
            listeners.add(listener.clone());
        }
        CrawlLoop::new(
            services,
            SharedConfig::new(self.config.clone()),
            self.controller.clone(),
            listeners,
        )
    }

    pub fn on_step_completed<F>(&mut self, hook: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(StepHook::new(hook)));
    }

    pub fn run(&self) -> Result<CrawlOutcome> {
        self.build()?.run(RUN_ID)
    }
}
