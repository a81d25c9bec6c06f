//! Tracing subscriber assembly for the gateway binaries.
//!
//! Console and file output carry independent level filters; file output is
//! handled by [`file::layer`], which writes date-stamped, size-rotated
//! streams under the configured log directory.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;

use anyhow::{Context as _, Result};
use tracing_subscriber::{layer::SubscriberExt as _, EnvFilter, Layer, Registry};

/// Registers a global subscriber with console logging and `additional_layer`.
///
/// `additional_layer` is typically the file layer from [`file::layer`],
/// already wrapped in its own filter; pass `None` to log to console only.
pub fn setup_global_subscriber<L>(console_directives: &str, additional_layer: Option<L>) -> Result<()>
where
    L: Layer<Registry> + Send + Sync,
{
    let console_filter = try_filter(console_directives)
        .with_context(|| format!("invalid log directives `{console_directives}`"))?;

    let subscriber = Registry::default()
        .with(additional_layer)
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter));

    tracing::subscriber::set_global_default(subscriber)
        .context("a global subscriber is already registered")?;

    Ok(())
}

/// Builds an [`EnvFilter`] from a directive string such as `info` or
/// `info,robolink_worker=debug`.
pub fn try_filter(directives: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    if directives.is_empty() {
        EnvFilter::try_new("info")
    } else {
        EnvFilter::try_new(directives)
    }
}

/// Convenience for tests: a subscriber that only lives for the current scope.
pub fn test(directives: &str) -> tracing::subscriber::DefaultGuard {
    let subscriber = Registry::default().with(
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_filter(EnvFilter::new(directives)),
    );
    tracing::subscriber::set_default(subscriber)
}
