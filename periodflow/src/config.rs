//! Plain configuration values handed to the pipeline core.

use crate::errors::{ConfigError, ManifestError};
use crate::manifest::{PipelineManifest, DEFAULT_MANIFEST_DOCUMENT};
use crate::observability::LogFormat;
use crate::period::PeriodLabel;
use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
use crate::storage::{DocumentStore, FsRepository, DEFAULT_LEDGER_DOCUMENT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settings for the resilient download step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Attempts per `(entity, period)` pair before it is failed for good.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Pairs per checkpoint.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent fetches within a batch.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Consecutive rate-limit signals that trigger an egress rotation.
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: usize,
    /// Backoff applied before each rotation. Its `max_attempts` bounds the
    /// rotations allowed in one run before the step gives up.
    #[serde(default = "default_rotation_backoff")]
    pub rotation_backoff: RetryConfig,
    /// Pause between retry rounds within one run.
    #[serde(default)]
    pub retry_round_delay_ms: u64,
}

const fn default_retry_ceiling() -> u32 {
    3
}

const fn default_batch_size() -> usize {
    50
}

const fn default_worker_concurrency() -> usize {
    4
}

const fn default_rate_limit_threshold() -> usize {
    3
}

fn default_rotation_backoff() -> RetryConfig {
    RetryConfig::new()
        .with_base_delay_ms(2000)
        .with_max_delay_ms(120_000)
        .with_backoff(BackoffStrategy::Exponential)
        .with_jitter(JitterStrategy::Equal)
        .with_max_attempts(5)
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: default_retry_ceiling(),
            batch_size: default_batch_size(),
            worker_concurrency: default_worker_concurrency(),
            rate_limit_threshold: default_rate_limit_threshold(),
            rotation_backoff: default_rotation_backoff(),
            retry_round_delay_ms: 0,
        }
    }
}

impl DownloadConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub const fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the worker concurrency.
    #[must_use]
    pub const fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    /// Sets the rate-limit threshold.
    #[must_use]
    pub const fn with_rate_limit_threshold(mut self, threshold: usize) -> Self {
        self.rate_limit_threshold = threshold;
        self
    }

    /// Sets the rotation limit, kept on the rotation backoff.
    #[must_use]
    pub fn with_max_rotation_attempts(mut self, attempts: usize) -> Self {
        self.rotation_backoff.max_attempts = attempts;
        self
    }

    /// Sets the rotation backoff.
    #[must_use]
    pub fn with_rotation_backoff(mut self, backoff: RetryConfig) -> Self {
        self.rotation_backoff = backoff;
        self
    }

    /// Sets the pause between retry rounds.
    #[must_use]
    pub const fn with_retry_round_delay_ms(mut self, delay: u64) -> Self {
        self.retry_round_delay_ms = delay;
        self
    }

    /// Pause between retry rounds as a Duration.
    #[must_use]
    pub const fn retry_round_delay(&self) -> Duration {
        Duration::from_millis(self.retry_round_delay_ms)
    }

    /// Rejects values the downloader cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("download.retry_ceiling", u64::from(self.retry_ceiling)),
            ("download.batch_size", self.batch_size as u64),
            ("download.worker_concurrency", self.worker_concurrency as u64),
            ("download.rate_limit_threshold", self.rate_limit_threshold as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Everything the core needs for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The period every step works on.
    pub target_period: PeriodLabel,
    /// Where upstream artifacts are read from.
    #[serde(default = "default_root")]
    pub input_root: PathBuf,
    /// Where outputs, the manifest and ledgers are written.
    #[serde(default = "default_root")]
    pub output_root: PathBuf,
    /// Document name of the manifest.
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// Document name of the progress ledgers.
    #[serde(default = "default_ledger_name")]
    pub ledger_name: String,
    /// Download step settings.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_manifest_name() -> String {
    DEFAULT_MANIFEST_DOCUMENT.to_string()
}

fn default_ledger_name() -> String {
    DEFAULT_LEDGER_DOCUMENT.to_string()
}

impl PipelineConfig {
    /// Creates a config for `target_period` with default roots.
    #[must_use]
    pub fn new(target_period: PeriodLabel) -> Self {
        Self {
            target_period,
            input_root: default_root(),
            output_root: default_root(),
            manifest_name: default_manifest_name(),
            ledger_name: default_ledger_name(),
            download: DownloadConfig::default(),
            log_format: LogFormat::default(),
        }
    }

    /// Sets both roots.
    #[must_use]
    pub fn with_roots(mut self, input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        self.input_root = input_root.into();
        self.output_root = output_root.into();
        self
    }

    /// Sets the download settings.
    #[must_use]
    pub fn with_download(mut self, download: DownloadConfig) -> Self {
        self.download = download;
        self
    }

    /// Sets the log format.
    #[must_use]
    pub const fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// `Read` if the file cannot be read, `Parse` if it does not decode,
    /// `Invalid` if a value is out of range.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every nested value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("manifest_name", &self.manifest_name), ("ledger_name", &self.ledger_name)] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.manifest_name == self.ledger_name {
            return Err(ConfigError::Invalid {
                field: "ledger_name".to_string(),
                reason: "must differ from manifest_name".to_string(),
            });
        }
        self.download.validate()
    }

    /// A filesystem repository over the configured roots and ledger document.
    #[must_use]
    pub fn repository(&self) -> FsRepository {
        FsRepository::with_roots(&self.input_root, &self.output_root)
            .with_ledger_document(&self.ledger_name)
    }

    /// Loads the configured manifest document from `store`.
    pub fn load_manifest(&self, store: Arc<dyn DocumentStore>) -> Result<PipelineManifest, ManifestError> {
        PipelineManifest::load_named(store, &self.manifest_name)
    }
}
