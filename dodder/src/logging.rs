//! Development-time tracing for debugging dodder.
//!
//! Tracing is for diagnostics only. What the agent does (actions, command
//! output, refusals) is printed by the CLI regardless of `RUST_LOG`.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";

/// Filter for a raw `RUST_LOG` value. Unset, blank, or unparsable values
/// fall back to `warn` so a typo never silences warnings.
pub fn filter_from(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber (compact format).
///
/// # Example
/// ```bash
/// RUST_LOG=dodder=debug dodder run llama3.1 "add a README"
/// ```
pub fn init() -> Result<()> {
    let raw = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(filter_from(raw.as_deref()))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .context("install tracing subscriber")
}
