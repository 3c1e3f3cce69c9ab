//! Tracing subscriber setup.
//!
//! Logs go to stderr in a compact format. The level comes from the
//! `--log-level` flag; `RUST_LOG` overrides it when set.

use tracing_subscriber::EnvFilter;

use crate::error::{CrawlError, Result};

/// Initialize the global tracing subscriber from the configured level.
pub fn init(log_level: &str) -> Result<()> {
    let level = match log_level {
        "debug" | "info" | "warn" | "error" => log_level,
        other => {
            return Err(CrawlError::Fatal(format!("invalid log level: {other}")));
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gemcrawl={level},{level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
