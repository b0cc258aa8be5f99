//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::error::EngineError;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber. The filter comes from `RUST_LOG`
/// and defaults to `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Use
/// [`try_init_tracing`] where that can happen.
pub fn init_tracing(format: LogFormat) {
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(env_filter()).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(env_filter()).pretty().init(),
    }
}

/// Like [`init_tracing`] but fails instead of panicking.
///
/// # Errors
///
/// Returns `EngineError::Telemetry` if a global subscriber is already
/// installed.
pub fn try_init_tracing(format: LogFormat) -> Result<(), EngineError> {
    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .pretty()
            .try_init(),
    };
    result.map_err(|e| EngineError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        let _ = try_init_tracing(LogFormat::Pretty);

        let second = try_init_tracing(LogFormat::Json);

        assert!(matches!(second, Err(EngineError::Telemetry(_))));
    }
}
