//! Crawler configuration (TOML) and the live, operator-editable handle.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lower bound on the pause between consecutive device actions.
pub const MIN_ACTION_DELAY_MS: u64 = 500;

/// Crawler configuration (TOML).
///
/// Intended to be edited by operators between runs. Missing fields default to
/// values suitable for an unattended exploration of a single app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Step limit for a run; 0 disables the limit.
    pub max_steps: u32,

    /// Pause-aware wall-clock limit in seconds; 0 disables the limit.
    pub max_duration_secs: u64,

    /// Oracle attempts per step after the first one fails or is invalid.
    pub oracle_max_retries: u32,

    /// Interval of "still waiting" notifications during an oracle call.
    pub heartbeat_interval_ms: u64,

    /// Minimum delay between two consecutive device actions.
    pub action_delay_ms: u64,

    pub long_press_ms: u64,
    pub swipe_ms: u64,

    /// Consecutive visits to one screen tolerated before it counts as stuck.
    pub stuck_threshold: u32,

    /// Number of executed actions shown to the oracle as history.
    pub history_window: usize,

    /// Consecutive failed steps that end the run in error.
    pub max_consecutive_step_failures: u32,

    /// How long the loop blocks per wait while the run is paused.
    pub pause_poll_ms: u64,

    /// Root directory for per-run screenshots.
    pub artifacts_dir: PathBuf,

    pub recovery: RecoveryConfig,
    pub foreground: ForegroundConfig,
    pub adb: AdbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Session restarts allowed within one step.
    pub max_attempts: u32,

    /// Settle time after each session restart.
    pub delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForegroundConfig {
    /// Back presses tried before relaunching the target app.
    pub back_attempts: u32,

    pub settle_ms: u64,
}

impl Default for ForegroundConfig {
    fn default() -> Self {
        Self {
            back_attempts: 2,
            settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdbConfig {
    pub binary: String,

    /// Device serial passed as `-s`; empty uses the only attached device.
    pub serial: String,

    pub command_timeout_secs: u64,

    /// Packages force-stopped to restart the automation server.
    pub automation_packages: Vec<String>,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            binary: "adb".to_string(),
            serial: String::new(),
            command_timeout_secs: 30,
            automation_packages: vec![
                "io.appium.uiautomator2.server".to_string(),
                "io.appium.uiautomator2.server.test".to_string(),
            ],
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_duration_secs: 30 * 60,
            oracle_max_retries: 3,
            heartbeat_interval_ms: 5_000,
            action_delay_ms: MIN_ACTION_DELAY_MS,
            long_press_ms: 1_000,
            swipe_ms: 400,
            stuck_threshold: 3,
            history_window: 10,
            max_consecutive_step_failures: 3,
            pause_poll_ms: 500,
            artifacts_dir: PathBuf::from("artifacts"),
            recovery: RecoveryConfig::default(),
            foreground: ForegroundConfig::default(),
            adb: AdbConfig::default(),
        }
    }
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.action_delay_ms < MIN_ACTION_DELAY_MS {
            return Err(anyhow!("action_delay_ms must be >= {MIN_ACTION_DELAY_MS}"));
        }
        if self.stuck_threshold == 0 {
            return Err(anyhow!("stuck_threshold must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow!("heartbeat_interval_ms must be > 0"));
        }
        if self.pause_poll_ms == 0 {
            return Err(anyhow!("pause_poll_ms must be > 0"));
        }
        if self.max_consecutive_step_failures == 0 {
            return Err(anyhow!("max_consecutive_step_failures must be > 0"));
        }
        if self.long_press_ms == 0 || self.swipe_ms == 0 {
            return Err(anyhow!("long_press_ms and swipe_ms must be > 0"));
        }
        if self.artifacts_dir.as_os_str().is_empty() {
            return Err(anyhow!("artifacts_dir must be non-empty"));
        }
        if self.adb.binary.trim().is_empty() {
            return Err(anyhow!("adb.binary must be non-empty"));
        }
        if self.adb.command_timeout_secs == 0 {
            return Err(anyhow!("adb.command_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// `None` when unlimited.
    pub fn step_limit(&self) -> Option<u32> {
        (self.max_steps > 0).then_some(self.max_steps)
    }

    /// `None` when unlimited.
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery.delay_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CrawlerConfig::default()`.
pub fn load_config(path: &Path) -> Result<CrawlerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = CrawlerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CrawlerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CrawlerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Live configuration shared between an operator surface and the crawl loop.
///
/// The loop takes a [`snapshot`](SharedConfig::snapshot) at the start of each
/// run, so updates made before `run()` take effect for that run.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<CrawlerConfig>>,
}

impl SharedConfig {
    pub fn new(cfg: CrawlerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn snapshot(&self) -> Result<CrawlerConfig> {
        self.inner
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| anyhow!("config lock poisoned"))
    }

    /// Apply `f` to the live config; the result must still validate.
    pub fn update(&self, f: impl FnOnce(&mut CrawlerConfig)) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        let mut next = guard.clone();
        f(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CrawlerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("crawler.toml");
        let mut cfg = CrawlerConfig::default();
        cfg.max_steps = 0;
        cfg.adb.serial = "emulator-5554".to_string();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.step_limit(), None);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("crawler.toml");
        fs::write(&path, "max_steps = 7\n[recovery]\nmax_attempts = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_steps, 7);
        assert_eq!(cfg.recovery.max_attempts, 5);
        assert_eq!(cfg.recovery.delay_ms, 3_000);
        assert_eq!(cfg.stuck_threshold, 3);
    }

    #[test]
    fn action_delay_below_minimum_is_rejected() {
        let cfg = CrawlerConfig {
            action_delay_ms: 100,
            ..CrawlerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("action_delay_ms"));
    }

    #[test]
    fn shared_update_is_visible_in_next_snapshot() {
        let shared = SharedConfig::new(CrawlerConfig::default());
        let before = shared.snapshot().expect("snapshot");
        shared.update(|cfg| cfg.max_steps = 3).expect("update");
        assert_eq!(before.max_steps, 100);
        assert_eq!(shared.snapshot().expect("snapshot").max_steps, 3);

        assert!(shared.update(|cfg| cfg.stuck_threshold = 0).is_err());
        assert_eq!(shared.snapshot().expect("snapshot").stuck_threshold, 3);
    }
}
