//! Orchestration and resilience engine for autonomous mobile-app exploration.
//!
//! A crawl repeatedly captures the device screen, asks an external oracle
//! which actions to take, executes them and records what it learned about the
//! app's screens. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycle table, stuck counting,
//!   crash classification, budgets, fingerprint distance, action validation).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting seams (device driver, oracle, grounding,
//!   stores, mail, configuration, processes). Traits first, so the loop can
//!   be driven entirely by scripted collaborators in tests.
//!
//! Orchestration modules ([`crawl_loop`], [`step`], [`screen_tracker`],
//! [`recovery`], [`action_executor`], [`foreground`]) combine the two. The
//! operator surface is [`control::RunController`]; progress leaves the engine
//! through [`events::CrawlListener`].

pub mod action_executor;
pub mod control;
pub mod core;
pub mod crawl_loop;
pub mod events;
pub mod foreground;
pub mod heartbeat;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod screen_tracker;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
