//! Logging subsystem.
//!
//! Structured logging via tracing, JSON for production and plaintext for
//! development. `FERRY_LOG` is the primary filter variable, `RUST_LOG` the
//! fallback.

use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Plaintext,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            default_level: Level::DEBUG,
        }
    }

    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            default_level: Level::INFO,
        }
    }
}

fn build_env_filter(default_level: Level) -> EnvFilter {
    if let Ok(filter) = std::env::var("FERRY_LOG") {
        return EnvFilter::new(filter);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_level.to_string())
}

/// Initialize the global subscriber. Safe to call more than once; only the
/// first call installs anything.
pub fn init_logging(config: LogConfig) {
    if INIT_GUARD.set(()).is_err() {
        return;
    }
    let filter = build_env_filter(config.default_level);
    match config.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Plaintext => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_a_noop() {
        init_logging(LogConfig::development());
        init_logging(LogConfig::production());
    }

    #[test]
    fn test_default_config_is_plaintext_info() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.default_level, Level::INFO);
    }
}
