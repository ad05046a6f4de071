//! Keeps the target app in the foreground between steps.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::clock::Clock;
use crate::io::driver::DeviceDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundOutcome {
    AlreadyForeground,
    RestoredByBack { presses: u32 },
    Relaunched,
    /// Neither back presses nor a relaunch brought the app back.
    Lost,
}

impl ForegroundOutcome {
    pub fn in_foreground(self) -> bool {
        self != ForegroundOutcome::Lost
    }
}

/// Back presses first, then a relaunch.
///
/// Driver errors are returned so the caller can classify them as session
/// crashes; failing to restore the app is an outcome, not an error.
#[instrument(skip(driver, clock, settle))]
pub fn ensure_foreground(
    driver: &dyn DeviceDriver,
    clock: &dyn Clock,
    package: &str,
    back_attempts: u32,
    settle: Duration,
) -> Result<ForegroundOutcome> {
    let current = driver.current_package().context("query foreground package")?;
    if current == package {
        return Ok(ForegroundOutcome::AlreadyForeground);
    }
    warn!(%current, "target app not in foreground");

    for presses in 1..=back_attempts {
        driver.press_back().context("press back")?;
        clock.sleep(settle);
        if driver.current_package().context("query foreground package")? == package {
            info!(presses, "foreground restored with back");
            return Ok(ForegroundOutcome::RestoredByBack { presses });
        }
    }

    driver.launch_app(package).context("relaunch target app")?;
    clock.sleep(settle);
    let current = driver.current_package().context("query foreground package")?;
    if current == package {
        info!("foreground restored by relaunch");
        Ok(ForegroundOutcome::Relaunched)
    } else {
        warn!(%current, "could not restore target app");
        Ok(ForegroundOutcome::Lost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{DriverCall, ManualClock, ScriptedDriver};

    const PKG: &str = "com.example";

    #[test]
    fn already_foreground_touches_nothing() {
        let driver = ScriptedDriver::new(PKG);
        let clock = ManualClock::new();
        let outcome =
            ensure_foreground(&driver, &clock, PKG, 2, Duration::from_secs(1)).expect("check");
        assert_eq!(outcome, ForegroundOutcome::AlreadyForeground);
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn back_press_restores_app() {
        let driver = ScriptedDriver::new(PKG);
        driver.push_back_stack(PKG);
        driver.set_foreground("com.android.settings");
        let clock = ManualClock::new();
        let outcome =
            ensure_foreground(&driver, &clock, PKG, 2, Duration::from_secs(1)).expect("check");
        assert_eq!(outcome, ForegroundOutcome::RestoredByBack { presses: 1 });
        assert_eq!(driver.calls(), vec![DriverCall::PressBack]);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn relaunch_after_back_presses_fail() {
        let driver = ScriptedDriver::new(PKG);
        driver.set_foreground("com.android.launcher");
        let clock = ManualClock::new();
        let outcome = ensure_foreground(&driver, &clock, PKG, 2, Duration::ZERO).expect("check");
        assert_eq!(outcome, ForegroundOutcome::Relaunched);
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::PressBack,
                DriverCall::PressBack,
                DriverCall::LaunchApp(PKG.to_string()),
            ]
        );
    }

    #[test]
    fn unlaunchable_app_is_lost_not_error() {
        let driver = ScriptedDriver::new(PKG);
        driver.set_foreground("com.android.launcher");
        driver.ignore_launches();
        let clock = ManualClock::new();
        let outcome = ensure_foreground(&driver, &clock, PKG, 0, Duration::ZERO).expect("check");
        assert_eq!(outcome, ForegroundOutcome::Lost);
        assert!(!outcome.in_foreground());
    }
}
