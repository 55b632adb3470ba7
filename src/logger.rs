//! Logging macros and subscriber setup.

use tracing_subscriber::EnvFilter;

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { ::tracing::error!($($arg)*) };
}

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { default_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
