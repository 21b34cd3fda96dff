use crate::error::{OrchestratorError, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes the engine's logging system with the specified log level
///
/// `RUST_LOG` takes precedence over `log_level` when set. Valid levels are:
/// error, warn, info, debug, trace. Calling this twice is harmless; the
/// second subscriber is rejected and reported as a config error.
pub fn init(log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| OrchestratorError::Config(format!("Failed to install logger: {}", e)))
}

/// Initializes logging for tests, ignoring an already-installed subscriber
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Parses a log level string into a tracing Level
///
/// Returns the corresponding Level, defaulting to INFO for invalid strings
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("error"), Level::ERROR);
        assert_eq!(parse_log_level("warn"), Level::WARN);
        assert_eq!(parse_log_level("INFO"), Level::INFO);
        assert_eq!(parse_log_level("debug"), Level::DEBUG);
        assert_eq!(parse_log_level("trace"), Level::TRACE);
        assert_eq!(parse_log_level("invalid"), Level::INFO);
    }
}
