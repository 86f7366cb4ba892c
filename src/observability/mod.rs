//! Logging setup
//!
//! `RUST_LOG` takes precedence over `log.level` when set.

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Map a configured level name onto a filter directive
fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(&config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.source)
        .with_line_number(config.source)
        .with_target(false);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("warn"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive("bogus"), "info");
    }
}
