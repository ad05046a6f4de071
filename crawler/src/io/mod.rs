//! Side-effecting collaborators and the seams the crawl loop consumes.

pub mod adb;
pub mod capture;
pub mod clock;
pub mod config;
pub mod driver;
pub mod fingerprint;
pub mod grounding;
pub mod history;
pub mod mail;
pub mod oracle;
pub mod process;
pub mod store;
