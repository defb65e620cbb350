//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and tests that want
//! output call [`init_tracing`] once at startup.

use crate::errors::ObservabilityError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Builds the filter: `RUST_LOG` if set, otherwise `default_directive`.
///
/// # Errors
///
/// Returns `Filter` if `default_directive` does not parse.
pub fn env_filter(default_directive: &str) -> Result<EnvFilter, ObservabilityError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive).map_err(|e| ObservabilityError::Filter {
        directive: default_directive.to_string(),
        message: e.to_string(),
    })
}

/// Installs the global subscriber.
///
/// # Errors
///
/// `Filter` for a bad directive, `AlreadyInitialised` if a global
/// subscriber is already set.
pub fn init_tracing(format: LogFormat, default_directive: &str) -> Result<(), ObservabilityError> {
    let filter = env_filter(default_directive)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };
    result.map_err(|e| ObservabilityError::AlreadyInitialised(e.to_string()))
}
