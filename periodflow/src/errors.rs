//! Error types for the periodflow substrate.
//!
//! Each layer owns its own error enum. Lower layers are lifted into
//! [`StepError`] through `From` conversions so that a stage only ever
//! reports one of the pipeline-level failure classes, never a raw
//! transport or filesystem error.

use crate::download::LedgerKey;
use crate::period::PeriodLabel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while parsing or constructing a [`PeriodLabel`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    /// The input does not follow the `YYYYMM` + `A|B` shape.
    #[error("Malformed period label '{input}': {reason}")]
    Format {
        /// The offending input.
        input: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl PeriodError {
    /// Creates a format error.
    #[must_use]
    pub fn format(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised at the repository boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No backing artifact exists for the logical name.
    #[error("No artifact for '{logical_name}'{}", fmt_period(.period))]
    NotFound {
        /// The logical dataset or document name.
        logical_name: String,
        /// The requested period, if any.
        period: Option<PeriodLabel>,
        /// Physical locations that were tried, in order.
        tried: Vec<String>,
    },

    /// Required columns are absent from a tabular artifact.
    #[error("Dataset '{logical_name}' is missing required columns: {}", .missing.join(", "))]
    Schema {
        /// The logical dataset name.
        logical_name: String,
        /// The columns that were required but not found.
        missing: Vec<String>,
    },

    /// An underlying I/O operation failed.
    #[error("IO error while {context}: {source}")]
    Io {
        /// What the repository was doing.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A document or record could not be encoded or decoded.
    #[error("Serialization error while {context}: {message}")]
    Serialization {
        /// What the repository was doing.
        context: String,
        /// The decoder message.
        message: String,
    },
}

fn fmt_period(period: &Option<PeriodLabel>) -> String {
    period.map(|p| format!(" for period {p}")).unwrap_or_default()
}

impl StorageError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(
        logical_name: impl Into<String>,
        period: Option<PeriodLabel>,
        tried: Vec<String>,
    ) -> Self {
        Self::NotFound {
            logical_name: logical_name.into(),
            period,
            tried,
        }
    }

    /// Creates a schema error.
    #[must_use]
    pub fn schema(logical_name: impl Into<String>, missing: Vec<String>) -> Self {
        Self::Schema {
            logical_name: logical_name.into(),
            missing,
        }
    }

    /// Wraps an I/O error with context.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps a serialization failure with context.
    #[must_use]
    pub fn serialization(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised by the pipeline manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The requested output was never registered.
    #[error("Stage '{stage}' has no registered output '{output_key}'{}", fmt_period(.period))]
    NotFound {
        /// The producing stage.
        stage: String,
        /// The output key.
        output_key: String,
        /// The requested period, if any.
        period: Option<PeriodLabel>,
    },

    /// The manifest document could not be read or flushed.
    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Cannot read config {path}: {source}")]
    Read {
        /// The config path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("Invalid config {path}: {message}")]
    Parse {
        /// The config path.
        path: PathBuf,
        /// The decoder message.
        message: String,
    },

    /// A value is out of its allowed range.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised by typed metadata access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// The key has never been written.
    #[error("Metadata key '{key}' is not set")]
    Missing {
        /// The key name.
        key: String,
    },

    /// The stored value does not decode as the key's type.
    #[error("Metadata key '{key}' holds an incompatible value: {message}")]
    Type {
        /// The key name.
        key: String,
        /// The decoder message.
        message: String,
    },
}

/// Errors raised by the logging setup.
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// The filter directive could not be parsed.
    #[error("Invalid log filter '{directive}': {message}")]
    Filter {
        /// The directive.
        directive: String,
        /// Parser message.
        message: String,
    },

    /// A global subscriber was already installed.
    #[error("Tracing subscriber already initialised: {0}")]
    AlreadyInitialised(String),
}

/// Failure classes reported by a single external fetch.
///
/// These never escape the download step; they are folded into ledger
/// state and, when exhausted, into [`StepError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The service signalled rate limiting on the current egress path.
    #[error("Rate limited on egress '{egress}'")]
    RateLimited {
        /// The egress path that was throttled.
        egress: String,
    },

    /// A failure that may succeed on a later attempt.
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// A failure that will not succeed however often it is retried.
    #[error("Permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    /// Returns true if the error is a rate-limit signal.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The stage-level error taxonomy.
#[derive(Debug, Error)]
pub enum StepError {
    /// A required upstream output or metadata key is absent.
    #[error("Step '{step}' is missing required input '{input}'")]
    MissingInput {
        /// The step name.
        step: String,
        /// The missing input.
        input: String,
    },

    /// The transformation produced or received invalid data.
    #[error("Computation failed in step '{step}': {message}")]
    Computation {
        /// The step name.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// Structural violation that makes persistence unsafe.
    #[error("Data validation failed in step '{step}': {message}")]
    DataValidation {
        /// The step name.
        step: String,
        /// What went wrong.
        message: String,
    },

    /// Egress rotation was exhausted while the service kept blocking.
    #[error("External service exhausted after {attempts} rotation attempts: {last_error}")]
    ExternalServiceExhausted {
        /// Rotation attempts made.
        attempts: usize,
        /// The last error observed.
        last_error: String,
    },

    /// Some entity/period pairs failed permanently.
    #[error("Download incomplete: {} pair(s) failed permanently ({})", .failed.len(), join_keys(.failed))]
    IncompleteDownload {
        /// Pairs that reached the attempt ceiling.
        failed: Vec<LedgerKey>,
    },

    /// The step was cancelled at a batch boundary.
    #[error("Step cancelled: {0}")]
    Cancelled(String),

    /// A repository failure.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// A manifest failure.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// Invalid configuration handed to a step.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Typed metadata could not be read or written.
    #[error("{0}")]
    Metadata(#[from] MetadataError),
}

fn join_keys(keys: &[LedgerKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl StepError {
    /// Creates a missing input error.
    #[must_use]
    pub fn missing_input(step: impl Into<String>, input: impl Into<String>) -> Self {
        Self::MissingInput {
            step: step.into(),
            input: input.into(),
        }
    }

    /// Creates a computation error.
    #[must_use]
    pub fn computation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Computation {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Creates a data validation error.
    #[must_use]
    pub fn data_validation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataValidation {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Returns a short, stable code for the failure class.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingInput { .. } => "missing_input",
            Self::Computation { .. } => "computation",
            Self::DataValidation { .. } => "data_validation",
            Self::ExternalServiceExhausted { .. } => "external_service_exhausted",
            Self::IncompleteDownload { .. } => "incomplete_download",
            Self::Cancelled(_) => "cancelled",
            Self::Storage(StorageError::NotFound { .. })
            | Self::Manifest(ManifestError::NotFound { .. }) => "not_found",
            Self::Storage(StorageError::Schema { .. }) => "schema",
            Self::Storage(_) | Self::Manifest(_) => "storage",
            Self::Config(_) => "config",
            Self::Metadata(_) => "metadata",
        }
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Self::IncompleteDownload { failed } = self {
            let keys: Vec<String> = failed.iter().map(ToString::to_string).collect();
            map.insert("failed".to_string(), serde_json::json!(keys));
        }
        map
    }
}

/// Terminal signal a step reports to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSignal {
    /// All phases completed and validation passed.
    Success,
    /// All phases completed but validation flagged recoverable issues.
    SuccessWithWarnings,
    /// A phase failed.
    Failure,
}
