//! Tracing setup shared by both binaries

use crate::error::{RelayError, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Default log file of the relay when file logging is requested
pub const DEFAULT_LOG_FILE: &str = "openendec.log";

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `log_file` set, output is
/// appended to that file without ANSI colours instead of going to stderr.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    RelayError::Config(format!("cannot open log file {}: {e}", path.display()))
                })?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    installed.map_err(|e| RelayError::Config(format!("logging already initialised: {e}")))
}

/// `debug` when the flag is set, else the configured level
pub fn level(debug: bool, configured: &str) -> &str {
    if debug {
        "debug"
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_wins() {
        assert_eq!(level(true, "warn"), "debug");
        assert_eq!(level(false, "warn"), "warn");
    }
}
