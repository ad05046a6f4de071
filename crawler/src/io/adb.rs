//! [`DeviceDriver`] backed by the `adb` command-line tool.

use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Point, ScreenSize};
use crate::events::millis;
use crate::io::config::AdbConfig;
use crate::io::driver::DeviceDriver;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const TEXT_OUTPUT_LIMIT: usize = 1024 * 1024;
const SCREENSHOT_LIMIT: usize = 64 * 1024 * 1024;

const KEYCODE_BACK: &str = "4";
const KEYCODE_ESCAPE: &str = "111";

static FOCUS_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"mCurrentFocus=Window\{[^}]*?\s([\w.]+)/([\w.$]+)\}"));
static SIZE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(Physical|Override) size:\s*(\d+)x(\d+)"));

fn compiled(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex> {
    re.as_ref().map_err(|e| anyhow!("compile regex: {e}"))
}

pub struct AdbDriver {
    config: AdbConfig,
}

impl AdbDriver {
    pub fn new(config: AdbConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        if !self.config.serial.is_empty() {
            cmd.arg("-s").arg(&self.config.serial);
        }
        cmd
    }

    fn run(&self, args: &[&str], limit: usize) -> Result<CommandOutput> {
        let mut cmd = self.command();
        cmd.args(args);
        let out = run_command_with_timeout(
            cmd,
            Duration::from_secs(self.config.command_timeout_secs),
            limit,
        )
        .with_context(|| format!("adb {}", args.join(" ")))?;
        if out.timed_out {
            return Err(anyhow!(
                "adb {} timed out after {}s",
                args.join(" "),
                self.config.command_timeout_secs
            ));
        }
        if !out.status.success() {
            return Err(anyhow!(
                "adb {} failed ({:?}): {}",
                args.join(" "),
                out.status.code(),
                out.stderr_text()
            ));
        }
        Ok(out)
    }

    fn shell(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        Ok(self.run(&full, TEXT_OUTPUT_LIMIT)?.stdout_text())
    }

    fn focus(&self) -> Result<(String, String)> {
        let dump = self.shell(&["dumpsys", "window", "windows"])?;
        parse_focus(&dump)?.ok_or_else(|| anyhow!("no focused window reported by dumpsys"))
    }
}

impl DeviceDriver for AdbDriver {
    fn device_id(&self) -> String {
        if self.config.serial.is_empty() {
            "default".to_string()
        } else {
            self.config.serial.clone()
        }
    }

    fn current_package(&self) -> Result<String> {
        Ok(self.focus()?.0)
    }

    fn current_activity(&self) -> Result<Option<String>> {
        Ok(Some(self.focus()?.1))
    }

    fn press_back(&self) -> Result<()> {
        self.shell(&["input", "keyevent", KEYCODE_BACK]).map(drop)
    }

    #[instrument(skip(self))]
    fn launch_app(&self, package: &str) -> Result<()> {
        let out = self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])?;
        if out.contains("No activities found") {
            return Err(anyhow!("no launchable activity in {package}"));
        }
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        let out = self.run(&["exec-out", "screencap", "-p"], SCREENSHOT_LIMIT)?;
        if out.stdout_truncated > 0 {
            return Err(anyhow!("screenshot exceeded {SCREENSHOT_LIMIT} bytes"));
        }
        if out.stdout.is_empty() {
            return Err(anyhow!("screencap returned no data"));
        }
        Ok(out.stdout)
    }

    fn screen_size(&self) -> Result<ScreenSize> {
        let out = self.shell(&["wm", "size"])?;
        parse_screen_size(&out)?
            .ok_or_else(|| anyhow!("unrecognized wm size output: {}", out.trim()))
    }

    fn tap(&self, at: Point) -> Result<()> {
        let (x, y) = (at.x.to_string(), at.y.to_string());
        self.shell(&["input", "tap", &x, &y]).map(drop)
    }

    fn long_press(&self, at: Point, hold: Duration) -> Result<()> {
        // A zero-length swipe held in place is a long press.
        self.swipe(at, at, hold)
    }

    fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<()> {
        let args = [
            from.x.to_string(),
            from.y.to_string(),
            to.x.to_string(),
            to.y.to_string(),
            millis(duration).to_string(),
        ];
        let mut full = vec!["input", "swipe"];
        full.extend(args.iter().map(String::as_str));
        self.shell(&full).map(drop)
    }

    fn type_text(&self, text: &str) -> Result<()> {
        let escaped = escape_input_text(text);
        self.shell(&["input", "text", &escaped]).map(drop)
    }

    fn dismiss_keyboard(&self) -> Result<()> {
        self.shell(&["input", "keyevent", KEYCODE_ESCAPE]).map(drop)
    }

    fn open_url(&self, url: &str) -> Result<()> {
        let quoted = format!("'{}'", url.replace('\'', "%27"));
        self.shell(&["am", "start", "-a", "android.intent.action.VIEW", "-d", &quoted])
            .map(drop)
    }

    #[instrument(skip(self), fields(settle_ms = millis(settle)))]
    fn restart_session(&self, settle: Duration) -> Result<()> {
        for package in &self.config.automation_packages {
            debug!(%package, "force-stopping automation package");
            if let Err(err) = self.shell(&["am", "force-stop", package]) {
                warn!(%package, err = %err, "force-stop failed");
            }
        }
        thread::sleep(settle);
        let state = self.run(&["get-state"], TEXT_OUTPUT_LIMIT)?.stdout_text();
        if state.trim() != "device" {
            return Err(anyhow!("device not ready after restart: {}", state.trim()));
        }
        info!("automation session restarted");
        Ok(())
    }
}

/// `(package, activity)` of the focused window, with relative activity names
/// expanded against the package.
pub fn parse_focus(dumpsys: &str) -> Result<Option<(String, String)>> {
    let re = compiled(&FOCUS_RE)?;
    Ok(re.captures(dumpsys).map(|caps| {
        let package = caps[1].to_string();
        let activity = if caps[2].starts_with('.') {
            format!("{package}{}", &caps[2])
        } else {
            caps[2].to_string()
        };
        (package, activity)
    }))
}

/// Override size wins over physical size when both are reported.
pub fn parse_screen_size(output: &str) -> Result<Option<ScreenSize>> {
    let re = compiled(&SIZE_RE)?;
    let mut found = None;
    for caps in re.captures_iter(output) {
        let (Ok(width), Ok(height)) = (caps[2].parse::<u32>(), caps[3].parse::<u32>()) else {
            continue;
        };
        let size = ScreenSize { width, height };
        if &caps[1] == "Override" {
            return Ok(Some(size));
        }
        found = Some(size);
    }
    Ok(found)
}

/// Escape text for `input text`: `%s` for spaces, backslashes for shell
/// metacharacters.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        match ch {
            ' ' => out.push_str("%s"),
            '\\' | '\'' | '"' | '&' | '|' | '<' | '>' | ';' | '(' | ')' | '$' | '*' | '~'
            | '`' | '!' | '?' | '#' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}
