//! Diagnostic tracing for embedders of the crawler.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: developer diagnostics via `RUST_LOG`, written to
//!   stderr. Not persisted and not part of the crawl record.
//!
//! - **Crawl events (`events`)**: the product-facing progress stream delivered to
//!   listeners and sinks. Emitted regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
/// Returns false when a subscriber was already installed.
///
/// # Example
/// ```bash
/// RUST_LOG=crawler=debug,crawler::step=trace my-embedder
/// ```
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}
