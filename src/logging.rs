//! Logger initialization from the `log:` config block

use crate::config::{LogConfig, LogHandler, LogLevel};
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn level_for(level: LogLevel) -> Level {
    match level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    }
}

/// Install the global subscriber. The configured level is the default;
/// `RUST_LOG` directives still take precedence for finer scoping.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level_for(config.level).into());

    let result = match config.handler {
        LogHandler::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        LogHandler::Json => tracing_subscriber::fmt().json().with_env_filter(filter).try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for(LogLevel::Debug), Level::DEBUG);
        assert_eq!(level_for(LogLevel::Info), Level::INFO);
        assert_eq!(level_for(LogLevel::Warn), Level::WARN);
        assert_eq!(level_for(LogLevel::Error), Level::ERROR);
    }
}
