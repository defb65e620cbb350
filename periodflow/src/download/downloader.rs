//! Batch-checkpointed, resumable download loop.
//!
//! Work is the set of `(entity, period)` pairs the ledger says still need
//! fetching. Pairs are processed in fixed-size batches; within a batch up
//! to `worker_concurrency` fetches run at once and report back to a single
//! writer, which alone mutates the ledger and the output buffer. After each
//! batch the buffered records are appended to the repository and then the
//! ledger is persisted. That pair of writes is the resume checkpoint.
//!
//! A checkpoint only writes the ledger entries this run requested, merged
//! into whatever is stored, so concurrent runs of one stage over different
//! pairs keep each other's progress.

use super::egress::{DirectEgress, EgressRotator};
use super::fetcher::RecordFetcher;
use super::ledger::{EntryStatus, LedgerKey, ProgressLedger};
use crate::cancellation::CancellationToken;
use crate::config::DownloadConfig;
use crate::dataset::Row;
use crate::errors::{FetchError, StepError};
use crate::events::{EventSink, NoOpEventSink, DOWNLOAD_CHECKPOINT, DOWNLOAD_ROTATED};
use crate::period::PeriodLabel;
use crate::storage::Repository;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Column stamped onto every fetched row with the entity id.
pub const ENTITY_COLUMN: &str = "entity_id";
/// Column stamped onto every fetched row with the period label.
pub const PERIOD_COLUMN: &str = "period";

/// What one downloader run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReport {
    /// Distinct pairs requested.
    pub requested: usize,
    /// Pairs fetched successfully in this run.
    pub fetched: usize,
    /// Pairs already done before this run started.
    pub skipped_done: usize,
    /// Rows appended to the repository in this run.
    pub rows: usize,
    /// Pairs that reached the attempt ceiling, in key order.
    pub failed: Vec<LedgerKey>,
    /// Egress rotations performed.
    pub rotations: usize,
    /// Checkpoints written.
    pub batches: usize,
    /// Retry rounds started.
    pub rounds: usize,
}

impl DownloadReport {
    /// Returns true if every requested pair is done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct RotationState {
    consecutive_rate_limits: usize,
    attempts: usize,
}

type FetchOutcome = (LedgerKey, Result<Vec<Row>, FetchError>);

/// Fetches per-entity, per-period records with checkpointed progress.
pub struct Downloader {
    stage: String,
    output_name: String,
    repository: Arc<dyn Repository>,
    fetcher: Arc<dyn RecordFetcher>,
    egress: Arc<dyn EgressRotator>,
    config: DownloadConfig,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("stage", &self.stage)
            .field("output_name", &self.output_name)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Creates a downloader for `stage`, appending records to `output_name`.
    ///
    /// The ledger is stored under the stage name.
    pub fn new(
        stage: impl Into<String>,
        output_name: impl Into<String>,
        repository: Arc<dyn Repository>,
        fetcher: Arc<dyn RecordFetcher>,
    ) -> Self {
        Self {
            stage: stage.into(),
            output_name: output_name.into(),
            repository,
            fetcher,
            egress: Arc::new(DirectEgress),
            config: DownloadConfig::default(),
            sink: Arc::new(NoOpEventSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the download settings.
    #[must_use]
    pub fn with_config(mut self, config: DownloadConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the egress rotator.
    #[must_use]
    pub fn with_egress(mut self, egress: Arc<dyn EgressRotator>) -> Self {
        self.egress = egress;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the cancellation token checked between batches.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The stage name, also the ledger key.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The logical dataset records are appended to.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// The repository records and ledger live in.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// The active settings.
    #[must_use]
    pub const fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetches every pair of `entities × periods` that is not yet done.
    ///
    /// Returns a report whether or not some pairs failed permanently; the
    /// caller decides how to surface `report.failed`.
    ///
    /// # Errors
    ///
    /// `ExternalServiceExhausted` when rotation gives up, `Cancelled` when
    /// the token fires, `Storage` when a checkpoint cannot be written. In
    /// every case the last completed checkpoint is intact.
    pub async fn run(
        &self,
        entities: &[String],
        periods: &[PeriodLabel],
    ) -> Result<DownloadReport, StepError> {
        self.config.validate()?;

        let requested: BTreeSet<LedgerKey> = entities
            .iter()
            .flat_map(|entity| periods.iter().map(move |p| LedgerKey::new(entity.as_str(), *p)))
            .collect();
        let mut report = DownloadReport {
            requested: requested.len(),
            ..DownloadReport::default()
        };
        if requested.is_empty() {
            info!(stage = %self.stage, "Nothing to download");
            return Ok(report);
        }

        let mut ledger = self.repository.read_progress(&self.stage)?;
        let added = ledger.seed(entities.iter().map(String::as_str), periods);
        report.skipped_done = requested
            .iter()
            .filter(|key| ledger.get(key).is_some_and(|e| e.status == EntryStatus::Done))
            .count();
        if added > 0 {
            ledger = self
                .repository
                .write_progress(&self.stage, &ledger.subset(&requested))?;
        }
        info!(
            stage = %self.stage,
            requested = report.requested,
            already_done = report.skipped_done,
            new_pairs = added,
            "Download starting"
        );

        let ceiling = self.config.retry_ceiling;
        let mut rotation = RotationState::default();

        loop {
            let todo: Vec<LedgerKey> = ledger
                .work_remaining(ceiling)
                .into_iter()
                .filter(|key| requested.contains(key))
                .collect();
            if todo.is_empty() {
                break;
            }
            if report.rounds > 0 && self.config.retry_round_delay_ms > 0 {
                tokio::time::sleep(self.config.retry_round_delay()).await;
            }
            report.rounds += 1;
            debug!(stage = %self.stage, round = report.rounds, pending = todo.len(), "Retry round");

            for batch in todo.chunks(self.config.batch_size) {
                if self.cancel.is_cancelled() {
                    let reason = self.cancel.reason().unwrap_or_default();
                    warn!(stage = %self.stage, reason = %reason, "Download cancelled at batch boundary");
                    return Err(StepError::Cancelled(reason));
                }
                self.run_batch(batch, &requested, &mut ledger, &mut rotation, &mut report)
                    .await?;
            }
        }

        report.failed = ledger
            .permanently_failed(ceiling)
            .into_iter()
            .filter(|key| requested.contains(key))
            .collect();
        info!(
            stage = %self.stage,
            fetched = report.fetched,
            failed = report.failed.len(),
            rotations = report.rotations,
            batches = report.batches,
            "Download finished"
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        batch: &[LedgerKey],
        requested: &BTreeSet<LedgerKey>,
        ledger: &mut ProgressLedger,
        rotation: &mut RotationState,
        report: &mut DownloadReport,
    ) -> Result<(), StepError> {
        let ceiling = self.config.retry_ceiling;
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut tasks: JoinSet<FetchOutcome> = JoinSet::new();

        for key in batch {
            let key = key.clone();
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let egress = Arc::clone(&self.egress);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (key, Err(FetchError::Transient("worker pool closed".to_string())));
                };
                let path = egress.current();
                let result = AssertUnwindSafe(fetcher.fetch(&key, &path))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(FetchError::Transient("fetcher panicked".to_string())));
                (key, result)
            });
        }

        let mut buffer: BTreeMap<PeriodLabel, Vec<Row>> = BTreeMap::new();
        let mut exhausted = None;

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Fetch task did not complete");
                    continue;
                }
            };

            match result {
                Ok(rows) => {
                    rotation.consecutive_rate_limits = 0;
                    rotation.attempts = 0;
                    report.fetched += 1;
                    buffer
                        .entry(key.period)
                        .or_default()
                        .extend(rows.into_iter().map(|row| stamp(row, &key)));
                    ledger.entry_mut(&key).mark_done();
                }
                Err(FetchError::Permanent(message)) => {
                    rotation.consecutive_rate_limits = 0;
                    warn!(%key, error = %message, "Permanent fetch failure");
                    ledger
                        .entry_mut(&key)
                        .record_permanent_failure(message, ceiling);
                }
                Err(e @ FetchError::Transient(_)) => {
                    rotation.consecutive_rate_limits = 0;
                    debug!(%key, error = %e, "Transient fetch failure");
                    ledger.entry_mut(&key).record_failure(e.to_string(), ceiling);
                }
                Err(e @ FetchError::RateLimited { .. }) => {
                    debug!(%key, error = %e, "Rate limited, pair stays pending");
                    ledger.entry_mut(&key).record_rate_limited(e.to_string());
                    if let Err(err) = self.on_rate_limited(&e, rotation, report).await {
                        tasks.abort_all();
                        exhausted = Some(err);
                        break;
                    }
                }
            }
        }

        self.checkpoint(buffer, requested, ledger, report)?;
        match exhausted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn on_rate_limited(
        &self,
        error: &FetchError,
        rotation: &mut RotationState,
        report: &mut DownloadReport,
    ) -> Result<(), StepError> {
        rotation.consecutive_rate_limits += 1;
        if rotation.consecutive_rate_limits < self.config.rate_limit_threshold {
            return Ok(());
        }
        rotation.consecutive_rate_limits = 0;

        if self.config.rotation_backoff.is_exhausted(rotation.attempts) {
            warn!(
                stage = %self.stage,
                attempts = rotation.attempts,
                "Egress rotation exhausted"
            );
            return Err(StepError::ExternalServiceExhausted {
                attempts: rotation.attempts,
                last_error: error.to_string(),
            });
        }

        let delay = self.config.rotation_backoff.delay_for(rotation.attempts);
        rotation.attempts += 1;
        tokio::time::sleep(delay).await;

        let from = self.egress.current();
        let to = self.egress.rotate();
        report.rotations += 1;
        let to_name = to.as_ref().map_or_else(|| from.name.clone(), |p| p.name.clone());
        info!(
            stage = %self.stage,
            from = %from,
            to = %to_name,
            attempt = rotation.attempts,
            "Rotated egress path"
        );
        self.sink.emit(
            DOWNLOAD_ROTATED,
            Some(json!({
                "stage": self.stage,
                "from": from.name,
                "to": to_name,
                "attempt": rotation.attempts,
                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            })),
        );
        Ok(())
    }

    /// Appends buffered rows, then merges the requested entries into the
    /// stored ledger and adopts the merged result.
    fn checkpoint(
        &self,
        buffer: BTreeMap<PeriodLabel, Vec<Row>>,
        requested: &BTreeSet<LedgerKey>,
        ledger: &mut ProgressLedger,
        report: &mut DownloadReport,
    ) -> Result<(), StepError> {
        let mut rows = 0;
        for (period, records) in &buffer {
            if records.is_empty() {
                continue;
            }
            self.repository
                .append_tabular(&self.output_name, Some(*period), records)?;
            rows += records.len();
        }
        *ledger = self
            .repository
            .write_progress(&self.stage, &ledger.subset(requested))?;
        report.rows += rows;
        report.batches += 1;

        let summary = ledger.summary();
        debug!(
            stage = %self.stage,
            batch = report.batches,
            rows,
            done = summary.done,
            pending = summary.pending,
            failed = summary.failed,
            "Checkpoint written"
        );
        self.sink.emit(
            DOWNLOAD_CHECKPOINT,
            Some(json!({
                "stage": self.stage,
                "batch": report.batches,
                "rows": rows,
                "summary": summary,
            })),
        );
        Ok(())
    }
}

/// Overwrites the key columns; the ledger key is authoritative.
fn stamp(mut row: Row, key: &LedgerKey) -> Row {
    row.insert(ENTITY_COLUMN.to_string(), json!(key.entity_id));
    row.insert(PERIOD_COLUMN.to_string(), json!(key.period.to_string()));
    row
}
