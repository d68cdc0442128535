//! Logging setup
//!
//! `fmt` output filtered by an `EnvFilter` behind a reload layer, so that the
//! backend's `/loglevel` command can change verbosity while running.

use fitbridge_runtime::{LogControl, ServiceError};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{CliError, Result};

/// Handle onto the installed filter
#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

/// Install the global subscriber; `RUST_LOG` wins over `verbose`
pub fn init(verbose: bool) -> Result<LogHandle> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| CliError::Logging(e.to_string()))?;
    Ok(LogHandle { handle })
}

/// Map a level name onto a filter directive
///
/// Accepts the `tracing` names plus `warning` and `critical`.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

impl LogControl for LogHandle {
    fn set_level(&self, level: &str) -> fitbridge_runtime::Result<()> {
        let directive = level_directive(level)
            .ok_or_else(|| ServiceError::bad_request(format!("unknown log level {level:?}")))?;
        self.handle
            .reload(EnvFilter::new(directive))
            .map_err(|e| ServiceError::bad_request(e.to_string()))?;
        info!("Log level set to {}", directive);
        Ok(())
    }
}
