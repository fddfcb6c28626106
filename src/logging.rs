//! Logger initialisation for embedding applications

use crate::config::LoggingConfig;
use std::str::FromStr;

/// Install `env_logger` using the configured level as the default filter.
///
/// `RUST_LOG` still takes precedence. Calling this more than once is harmless,
/// only the first call installs a logger.
pub fn init(config: &LoggingConfig) -> bool {
    let level = log::LevelFilter::from_str(&config.level).unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level.to_string().to_lowercase()),
    )
    .format_timestamp_millis()
    .try_init()
    .is_ok()
}
