//! Logging setup
//!
//! tracing with an env-filter; quiet silences everything, verbose opens the
//! debug spigot, and an optional log file tees the same stream to disk.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::sync::{Arc, Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for crate_name in ["wirebroker_core", "wirebroker_netstack", "wirebroker_tunnel", "wirebroker"] {
        filter = filter.add_directive(
            format!("{}={}", crate_name, level)
                .parse()
                .map_err(|e| Error::config(format!("invalid log directive: {}", e)))?,
        );
    }
    for noisy in ["tokio=warn", "hyper=warn", "reqwest=warn", "rustls=warn", "boringtun=warn"] {
        filter = filter.add_directive(
            noisy
                .parse()
                .map_err(|e| Error::config(format!("invalid log directive: {}", e)))?,
        );
    }
    Ok(filter)
}

/// Initialize the global subscriber once. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_inner(config);
    });
    result
}

fn init_inner(config: &LogConfig) -> Result<()> {
    let level = if config.verbose {
        "debug"
    } else if config.quiet {
        "error"
    } else {
        "info"
    };

    // Quiet keeps the console down to errors only via the level filter;
    // a log file, when configured, gets the same stream.
    let console = if config.quiet {
        None
    } else {
        Some(
            fmt::layer()
                .with_target(false)
                .compact()
                .with_filter(build_filter(level)?),
        )
    };

    let file = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::config(format!("cannot open log file {}: {}", path, e)))?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(build_filter(level)?),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(console).with(file);
    if registry.try_init().is_err() {
        tracing::debug!("tracing already initialized, keeping existing subscriber");
    }
    Ok(())
}
