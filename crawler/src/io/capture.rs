//! Auxiliary device captures (traffic, video, ...) that run alongside a crawl
//! and must be stopped when it ends.

use anyhow::Result;

pub trait AuxiliaryCapture: Send {
    fn name(&self) -> &str;

    /// Stop capturing and flush artifacts. Called once per run.
    fn stop(&mut self) -> Result<()>;
}
