//! Turns validated actions into device gestures.
//!
//! Every operation returns an [`ActionResult`] instead of an error: failures
//! are data the loop inspects (crash classification, batch cut-off). A
//! minimum delay separates consecutive operations on one executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{Action, ActionKind, ActionResult, BoundingBox, ScreenSize};
use crate::io::clock::Clock;
use crate::events::millis;
use crate::io::config::{CrawlerConfig, MIN_ACTION_DELAY_MS};
use crate::io::driver::DeviceDriver;
use crate::io::mail::{MailClient, extract_otp, extract_verification_link};

const MAIL_NOT_CONFIGURED: &str = "mail client not configured";

pub const MIN_ACTION_DELAY: Duration = Duration::from_millis(MIN_ACTION_DELAY_MS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Raised to [`MIN_ACTION_DELAY`] when lower.
    pub min_delay: Duration,
    pub long_press: Duration,
    pub swipe: Duration,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &CrawlerConfig) -> Self {
        Self {
            min_delay: cfg.action_delay(),
            long_press: Duration::from_millis(cfg.long_press_ms),
            swipe: Duration::from_millis(cfg.swipe_ms),
        }
    }
}

/// Swipe endpoints as screen fractions; a swipe moves content the opposite way.
fn scroll_vector(kind: ActionKind) -> Option<((f64, f64), (f64, f64))> {
    match kind {
        ActionKind::ScrollDown => Some(((0.5, 0.7), (0.5, 0.3))),
        ActionKind::ScrollUp => Some(((0.5, 0.3), (0.5, 0.7))),
        ActionKind::ScrollRight => Some(((0.8, 0.5), (0.2, 0.5))),
        ActionKind::ScrollLeft => Some(((0.2, 0.5), (0.8, 0.5))),
        _ => None,
    }
}

pub struct ActionExecutor {
    driver: Arc<dyn DeviceDriver>,
    clock: Arc<dyn Clock>,
    mail: Option<Arc<dyn MailClient>>,
    settings: ExecutorSettings,
    target_package: Option<String>,
    last_action_at: Option<Instant>,
    screen_size: Option<ScreenSize>,
}

impl ActionExecutor {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        clock: Arc<dyn Clock>,
        mail: Option<Arc<dyn MailClient>>,
        settings: ExecutorSettings,
    ) -> Self {
        if settings.min_delay < MIN_ACTION_DELAY {
            debug!(requested_ms = millis(settings.min_delay), "raising action delay to minimum");
        }
        Self {
            driver,
            clock,
            mail,
            settings: ExecutorSettings {
                min_delay: settings.min_delay.max(MIN_ACTION_DELAY),
                ..settings
            },
            target_package: None,
            last_action_at: None,
            screen_size: None,
        }
    }

    /// Package whose loss marks a result as `navigated_away`.
    pub fn set_target_package(&mut self, package: Option<String>) {
        self.target_package = package;
    }

    pub fn settings(&self) -> ExecutorSettings {
        self.settings
    }

    /// Dispatch on the action kind.
    #[instrument(skip_all, fields(kind = %action.kind))]
    pub fn execute(&mut self, action: &Action) -> ActionResult {
        let kind = action.kind;
        match (kind, action.target) {
            (ActionKind::Click, Some(target)) => self.click(target),
            (ActionKind::Input, Some(target)) => {
                self.input(target, action.input_text.as_deref().unwrap_or_default())
            }
            (ActionKind::LongPress, Some(target)) => self.long_press(target),
            (ActionKind::ExtractOtp, Some(target)) => self.extract_otp(target),
            (ActionKind::ScrollUp, _) => self.scroll_up(),
            (ActionKind::ScrollDown, _) => self.scroll_down(),
            (ActionKind::ScrollLeft, _) => self.scroll_left(),
            (ActionKind::ScrollRight, _) => self.scroll_right(),
            (ActionKind::Back, _) => self.back(),
            (ActionKind::ClickVerificationLink, _) => self.click_verification_link(),
            (_, None) => ActionResult::failed(kind, "", 0, format!("{kind} requires a target")),
        }
    }

    pub fn click(&mut self, target: BoundingBox) -> ActionResult {
        let at = target.center();
        self.perform(ActionKind::Click, describe(target), |this| this.driver.tap(at))
    }

    /// Tap the field, type, then dismiss the keyboard.
    pub fn input(&mut self, target: BoundingBox, text: &str) -> ActionResult {
        let at = target.center();
        let text = text.to_string();
        self.perform(ActionKind::Input, describe(target), move |this| {
            this.driver.tap(at)?;
            this.driver.type_text(&text)?;
            this.driver.dismiss_keyboard()
        })
    }

    pub fn long_press(&mut self, target: BoundingBox) -> ActionResult {
        let at = target.center();
        let hold = self.settings.long_press;
        self.perform(ActionKind::LongPress, describe(target), move |this| {
            this.driver.long_press(at, hold)
        })
    }

    pub fn scroll_up(&mut self) -> ActionResult {
        self.scroll(ActionKind::ScrollUp)
    }

    pub fn scroll_down(&mut self) -> ActionResult {
        self.scroll(ActionKind::ScrollDown)
    }

    pub fn scroll_left(&mut self) -> ActionResult {
        self.scroll(ActionKind::ScrollLeft)
    }

    pub fn scroll_right(&mut self) -> ActionResult {
        self.scroll(ActionKind::ScrollRight)
    }

    fn scroll(&mut self, kind: ActionKind) -> ActionResult {
        let duration = self.settings.swipe;
        self.perform(kind, "screen", move |this| {
            let ((fx1, fy1), (fx2, fy2)) =
                scroll_vector(kind).ok_or_else(|| anyhow!("{kind} is not a scroll"))?;
            let size = this.screen_size()?;
            this.driver
                .swipe(size.at(fx1, fy1), size.at(fx2, fy2), duration)
        })
    }

    pub fn back(&mut self) -> ActionResult {
        self.perform(ActionKind::Back, "device", |this| this.driver.press_back())
    }

    /// Type the newest OTP from the mail inbox into `target`.
    pub fn extract_otp(&mut self, target: BoundingBox) -> ActionResult {
        let Some(mail) = self.mail.clone() else {
            return ActionResult::failed(
                ActionKind::ExtractOtp,
                describe(target),
                0,
                MAIL_NOT_CONFIGURED,
            );
        };
        let at = target.center();
        self.perform(ActionKind::ExtractOtp, describe(target), move |this| {
            let message = mail
                .latest_message()?
                .ok_or_else(|| anyhow!("no mail message available"))?;
            let code = extract_otp(&message)?
                .ok_or_else(|| anyhow!("no OTP found in '{}'", message.subject))?;
            debug!(digits = code.len(), "typing OTP");
            this.driver.tap(at)?;
            this.driver.type_text(&code)?;
            this.driver.dismiss_keyboard()
        })
    }

    /// Open the verification link from the newest mail message.
    pub fn click_verification_link(&mut self) -> ActionResult {
        let Some(mail) = self.mail.clone() else {
            return ActionResult::failed(
                ActionKind::ClickVerificationLink,
                "",
                0,
                MAIL_NOT_CONFIGURED,
            );
        };
        self.perform(ActionKind::ClickVerificationLink, "mail", move |this| {
            let message = mail
                .latest_message()?
                .ok_or_else(|| anyhow!("no mail message available"))?;
            let link = extract_verification_link(&message)?
                .ok_or_else(|| anyhow!("no link found in '{}'", message.subject))?;
            this.driver.open_url(&link)
        })
    }

    fn screen_size(&mut self) -> Result<ScreenSize> {
        if let Some(size) = self.screen_size {
            return Ok(size);
        }
        let size = self.driver.screen_size()?;
        self.screen_size = Some(size);
        Ok(size)
    }

    fn pace(&self) {
        if let Some(last) = self.last_action_at {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.settings.min_delay {
                self.clock.sleep(self.settings.min_delay - elapsed);
            }
        }
    }

    fn perform(
        &mut self,
        kind: ActionKind,
        target: impl Into<String>,
        op: impl FnOnce(&mut Self) -> Result<()>,
    ) -> ActionResult {
        self.pace();
        let started = self.clock.now();
        let outcome = op(self);
        let finished = self.clock.now();
        self.last_action_at = Some(finished);
        let duration_ms = millis(finished.saturating_duration_since(started));

        match outcome {
            Ok(()) => {
                let mut result = ActionResult::succeeded(kind, target, duration_ms);
                result.navigated_away = self.left_target_app();
                result
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(%kind, %error, "action failed");
                ActionResult::failed(kind, target, duration_ms, error)
            }
        }
    }

    fn left_target_app(&self) -> bool {
        let Some(target) = &self.target_package else {
            return false;
        };
        match self.driver.current_package() {
            Ok(current) => current != *target,
            Err(err) => {
                debug!(err = %format!("{err:#}"), "foreground check after action failed");
                false
            }
        }
    }
}

fn describe(target: BoundingBox) -> String {
    format!("{target} @ {}", target.center())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point;
    use crate::io::mail::MailMessage;
    use crate::test_support::{DriverCall, ManualClock, ScriptedDriver, ScriptedMail};

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            min_delay: Duration::from_millis(500),
            long_press: Duration::from_millis(1000),
            swipe: Duration::from_millis(400),
        }
    }

    fn executor(
        driver: &Arc<ScriptedDriver>,
        mail: Option<Arc<dyn MailClient>>,
    ) -> (ActionExecutor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let mut executor = ActionExecutor::new(driver.clone(), clock.clone(), mail, settings());
        executor.set_target_package(Some("com.example".to_string()));
        (executor, clock)
    }

    #[test]
    fn consecutive_actions_are_paced() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, clock) = executor(&driver, None);
        assert!(executor.click(BoundingBox::new(0, 0, 100, 100)).success);
        assert!(executor.back().success);
        clock.advance(Duration::from_millis(300));
        assert!(executor.back().success);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(500), Duration::from_millis(200)]
        );
    }

    #[test]
    fn delay_below_minimum_is_raised() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let clock = Arc::new(ManualClock::new());
        let settings = ExecutorSettings {
            min_delay: Duration::ZERO,
            ..settings()
        };
        let mut executor = ActionExecutor::new(driver, clock.clone(), None, settings);
        assert_eq!(executor.settings().min_delay, MIN_ACTION_DELAY);

        assert!(executor.back().success);
        assert!(executor.back().success);
        assert_eq!(clock.sleeps(), vec![MIN_ACTION_DELAY]);
    }

    #[test]
    fn click_taps_center_and_describes_target() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, _) = executor(&driver, None);
        let result = executor.click(BoundingBox::new(100, 200, 300, 400));
        assert!(result.success);
        assert!(!result.navigated_away);
        assert_eq!(result.target, "[100,200]-[300,400] @ (200, 300)");
        assert_eq!(driver.calls(), vec![DriverCall::Tap(Point::new(200, 300))]);
    }

    #[test]
    fn input_types_then_dismisses_keyboard() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, _) = executor(&driver, None);
        let result = executor.input(BoundingBox::new(0, 0, 10, 10), "alice");
        assert!(result.success);
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Tap(Point::new(5, 5)),
                DriverCall::TypeText("alice".to_string()),
                DriverCall::DismissKeyboard,
            ]
        );
    }

    #[test]
    fn scrolls_use_screen_fractions() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, _) = executor(&driver, None);
        assert!(executor.scroll_down().success);
        assert_eq!(
            driver.calls(),
            vec![DriverCall::Swipe(
                Point::new(540, 1680),
                Point::new(540, 720),
                Duration::from_millis(400)
            )]
        );
    }

    #[test]
    fn driver_error_becomes_failed_result() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        driver.fail_next_gesture("socket hang up");
        let (mut executor, _) = executor(&driver, None);
        let result = executor.long_press(BoundingBox::new(0, 0, 10, 10));
        assert!(!result.success);
        assert_eq!(result.action, ActionKind::LongPress);
        assert!(result.error.as_deref().unwrap_or_default().contains("socket hang up"));
    }

    #[test]
    fn leaving_the_target_app_sets_navigated_away() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        driver.leave_app_on_next_gesture("com.android.chrome");
        let (mut executor, _) = executor(&driver, None);
        let result = executor.click(BoundingBox::new(0, 0, 10, 10));
        assert!(result.success);
        assert!(result.navigated_away);
    }

    #[test]
    fn mail_actions_fail_fast_without_client() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, clock) = executor(&driver, None);
        let otp = executor.extract_otp(BoundingBox::new(0, 0, 10, 10));
        let link = executor.click_verification_link();
        for result in [otp, link] {
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some(MAIL_NOT_CONFIGURED));
        }
        assert!(driver.calls().is_empty());
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn otp_and_link_come_from_latest_message() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let mail = Arc::new(ScriptedMail::new());
        mail.push(MailMessage {
            subject: "Your code 913377".to_string(),
            body: "Or confirm at https://example.com/confirm?t=1".to_string(),
            received_at: None,
        });
        let (mut executor, _) = executor(&driver, Some(mail as Arc<dyn MailClient>));

        assert!(executor.extract_otp(BoundingBox::new(0, 0, 10, 10)).success);
        assert!(executor.click_verification_link().success);
        let calls = driver.calls();
        assert!(calls.contains(&DriverCall::TypeText("913377".to_string())));
        assert_eq!(
            calls.last(),
            Some(&DriverCall::OpenUrl("https://example.com/confirm?t=1".to_string()))
        );
    }

    #[test]
    fn execute_rejects_missing_target() {
        let driver = Arc::new(ScriptedDriver::new("com.example"));
        let (mut executor, _) = executor(&driver, None);
        let action = Action {
            kind: ActionKind::Click,
            target: None,
            label: None,
            input_text: None,
            rationale: String::new(),
        };
        let result = executor.execute(&action);
        assert!(!result.success);
        assert!(driver.calls().is_empty());
    }
}
