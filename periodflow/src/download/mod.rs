//! Resilient download step.
//!
//! Fetches external per-entity, per-period records under unreliable
//! network conditions. Progress lives in a [`ProgressLedger`] persisted
//! through the repository after every batch, so an interrupted run resumes
//! exactly where its last checkpoint left off.

mod downloader;
pub mod egress;
pub mod fetcher;
mod ledger;
mod step;

pub use downloader::{DownloadReport, Downloader, ENTITY_COLUMN, PERIOD_COLUMN};
pub use egress::{DirectEgress, EgressPath, EgressRotator, RoundRobinEgress};
pub use fetcher::RecordFetcher;
#[cfg(feature = "http")]
pub use fetcher::HttpRecordFetcher;
pub use ledger::{EntryStatus, LedgerEntry, LedgerKey, LedgerSummary, ProgressLedger};
pub use step::{DownloadStep, EntitySource, DOWNLOAD_REPORT};
