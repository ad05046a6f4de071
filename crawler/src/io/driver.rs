//! Device-automation seam.
//!
//! The [`DeviceDriver`] trait decouples the crawl loop from the automation
//! backend (currently `adb`, see [`crate::io::adb`]). Tests use a scripted
//! driver that records gestures and injects failures without a device.
//!
//! Errors are reported as `anyhow` chains; the recovery manager classifies them
//! by their rendered text, so adapters must keep the backend's original message
//! in the chain.

use std::time::Duration;

use anyhow::Result;

use crate::core::types::{Point, ScreenSize};

pub trait DeviceDriver: Send + Sync {
    /// Identifier of the device this driver talks to.
    fn device_id(&self) -> String;

    /// Package owning the focused window.
    fn current_package(&self) -> Result<String>;

    fn current_activity(&self) -> Result<Option<String>>;

    fn press_back(&self) -> Result<()>;

    fn launch_app(&self, package: &str) -> Result<()>;

    /// PNG-encoded screenshot.
    fn screenshot(&self) -> Result<Vec<u8>>;

    fn screen_size(&self) -> Result<ScreenSize>;

    fn tap(&self, at: Point) -> Result<()>;

    fn long_press(&self, at: Point, hold: Duration) -> Result<()>;

    fn swipe(&self, from: Point, to: Point, duration: Duration) -> Result<()>;

    /// Type into the focused field.
    fn type_text(&self, text: &str) -> Result<()>;

    fn dismiss_keyboard(&self) -> Result<()>;

    fn open_url(&self, url: &str) -> Result<()>;

    /// Restart the automation server/session and block for `settle`.
    fn restart_session(&self, settle: Duration) -> Result<()>;
}
