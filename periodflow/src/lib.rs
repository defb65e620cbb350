//! # Periodflow
//!
//! A substrate for batch data pipelines keyed by half-month periods.
//!
//! Periodflow provides:
//!
//! - **Period labels**: `YYYYMMA`/`YYYYMMB` half-month identifiers with arithmetic
//! - **Repository**: period-versioned artifacts with a generic "latest" fallback
//! - **Pipeline manifest**: a durable registry of which stage wrote what, where
//! - **Step lifecycle**: setup, apply, validate, persist with typed errors
//! - **Resilient downloads**: a checkpointed ledger that survives crashes,
//!   bounded retries and egress rotation under rate limiting
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use periodflow::prelude::*;
//!
//! let repo = Arc::new(FsRepository::with_roots("data", "out"));
//! let manifest = Arc::new(PipelineManifest::load(repo.clone())?);
//! let downloader = Downloader::new("weather", "weather_data", repo.clone(), fetcher);
//!
//! let report = Pipeline::new(manifest.clone())
//!     .step(DownloadStep::new(downloader, EntitySource::dataset("stores", "store_id"), manifest))
//!     .run(StepContext::new("202509B".parse()?))
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod dataset;
pub mod download;
pub mod errors;
pub mod events;
pub mod manifest;
pub mod observability;
pub mod period;
pub mod retry;
pub mod step;
pub mod storage;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{DownloadConfig, PipelineConfig};
    pub use crate::context::{Metadata, MetadataKey, StepContext};
    pub use crate::dataset::{Dataset, Row};
    pub use crate::download::{
        DirectEgress, DownloadReport, DownloadStep, Downloader, EgressPath, EgressRotator,
        EntitySource, LedgerKey, ProgressLedger, RecordFetcher, RoundRobinEgress,
        DOWNLOAD_REPORT,
    };
    #[cfg(feature = "http")]
    pub use crate::download::HttpRecordFetcher;
    pub use crate::errors::{
        ConfigError, FetchError, ManifestError, PeriodError, ResultSignal, StepError,
        StorageError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::manifest::{ManifestEntry, PipelineManifest};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::period::{Half, PeriodLabel};
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryConfig};
    pub use crate::step::{Pipeline, PipelineReport, Step, StepRunner, StepState};
    pub use crate::storage::{
        DocumentStore, FsRepository, InMemoryRepository, KeyValueStore, Repository,
        TabularStore,
    };

    pub use async_trait::async_trait;
    pub use std::sync::Arc;
}

/// Version of the periodflow crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
