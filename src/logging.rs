//! Tracing subscriber setup.
//!
//! The configured `log_level` is the default filter; `RUST_LOG`, when set,
//! replaces it.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DeviceError};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| {
            DeviceError::Configuration(format!("Invalid log filter '{}': {}", default_level, e))
        }),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_from_config(application: &ApplicationConfig) -> AppResult<()> {
    let filter = env_filter(&application.log_level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if application.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| DeviceError::Configuration(format!("Logging already initialised: {}", e)))
}
