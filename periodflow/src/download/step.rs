//! The download stage as a pipeline [`Step`].

use super::downloader::{DownloadReport, Downloader, ENTITY_COLUMN, PERIOD_COLUMN};
use crate::context::{MetadataKey, StepContext};
use crate::dataset::Dataset;
use crate::errors::StepError;
use crate::manifest::PipelineManifest;
use crate::period::PeriodLabel;
use crate::step::Step;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Metadata key under which the step stores its [`DownloadReport`].
pub const DOWNLOAD_REPORT: MetadataKey<DownloadReport> = MetadataKey::new("download_report");

/// Where the entity ids come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySource {
    /// A fixed list.
    Fixed(Vec<String>),
    /// A column of an upstream tabular artifact for the target period
    /// (generic fallback applies).
    Dataset {
        /// Logical dataset name.
        logical_name: String,
        /// Column holding the entity id.
        column: String,
    },
}

impl EntitySource {
    /// Entities read from `column` of `logical_name`.
    #[must_use]
    pub fn dataset(logical_name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Dataset {
            logical_name: logical_name.into(),
            column: column.into(),
        }
    }
}

/// Downloads records for every entity over a window of periods ending at
/// the run's target period.
///
/// `setup` runs the downloader (which checkpoints as it goes) and loads
/// what is on disk for the window, `apply` drops duplicate rows left by
/// interrupted runs, and `persist` rewrites each period's artifact and
/// registers it. Pairs that failed permanently surface as
/// `IncompleteDownload` after everything fetched has been registered.
#[derive(Debug)]
pub struct DownloadStep {
    downloader: Downloader,
    entities: EntitySource,
    history: usize,
    key_columns: Option<Vec<String>>,
    manifest: Arc<PipelineManifest>,
}

impl DownloadStep {
    /// Creates the step. The stage name is the downloader's.
    #[must_use]
    pub fn new(downloader: Downloader, entities: EntitySource, manifest: Arc<PipelineManifest>) -> Self {
        Self {
            downloader,
            entities,
            history: 1,
            key_columns: None,
            manifest,
        }
    }

    /// Number of periods to cover, ending at the target period.
    #[must_use]
    pub const fn with_history(mut self, periods: usize) -> Self {
        self.history = periods;
        self
    }

    /// Columns identifying a record. Without them only exact duplicate
    /// rows are dropped.
    #[must_use]
    pub fn with_key_columns(mut self, columns: &[&str]) -> Self {
        self.key_columns = Some(columns.iter().map(ToString::to_string).collect());
        self
    }

    /// The periods fetched for `target`, oldest first.
    #[must_use]
    pub fn periods_for(&self, target: PeriodLabel) -> Vec<PeriodLabel> {
        if self.history == 0 {
            return Vec::new();
        }
        let back = i64::try_from(self.history - 1).unwrap_or(i64::MAX);
        PeriodLabel::range(target.advance(-back), self.history)
    }

    fn output_key(&self, period: PeriodLabel, target: PeriodLabel) -> String {
        let output = self.downloader.output_name();
        if period == target {
            output.to_string()
        } else {
            format!("{output}_{period}")
        }
    }

    fn resolve_entities(&self, period: PeriodLabel) -> Result<Vec<String>, StepError> {
        let (logical_name, column) = match &self.entities {
            EntitySource::Fixed(ids) => return Ok(ids.clone()),
            EntitySource::Dataset { logical_name, column } => (logical_name, column),
        };
        let dataset = self
            .downloader
            .repository()
            .read_tabular(logical_name, Some(period), &[column.as_str()])
            .map_err(|e| {
                if e.is_not_found() {
                    StepError::missing_input(self.name(), logical_name)
                } else {
                    e.into()
                }
            })?;

        Ok(dataset
            .rows()
            .iter()
            .filter_map(|row| match row.get(column) {
                Some(serde_json::Value::String(id)) => Some(id.clone()),
                Some(serde_json::Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
            .collect())
    }
}

fn row_period(step: &str, row: &crate::dataset::Row) -> Result<PeriodLabel, StepError> {
    row.get(PERIOD_COLUMN)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| StepError::data_validation(step, "row without a period label"))?
        .parse()
        .map_err(|e| StepError::data_validation(step, format!("{e}")))
}

#[async_trait]
impl Step for DownloadStep {
    fn name(&self) -> &str {
        self.downloader.stage()
    }

    fn writes(&self) -> &[&'static str] {
        &["download_report"]
    }

    async fn setup(&self, mut ctx: StepContext) -> Result<StepContext, StepError> {
        let target = ctx.period();
        let entities = self.resolve_entities(target)?;
        let periods = self.periods_for(target);

        let report = self.downloader.run(&entities, &periods).await?;
        ctx.metadata_mut().set(&DOWNLOAD_REPORT, &report)?;

        let repository = self.downloader.repository();
        let output = self.downloader.output_name();
        let available = repository.list_periods(output)?;
        let mut data = Dataset::new();
        for period in periods.iter().filter(|p| available.contains(p)) {
            data.extend(repository.read_tabular(output, Some(*period), &[])?.into_rows());
        }
        Ok(ctx.with_data(data))
    }

    fn apply(&self, mut ctx: StepContext) -> Result<StepContext, StepError> {
        let data = ctx.take_data();
        let before = data.len();
        let columns: Vec<String> = match &self.key_columns {
            Some(columns) => columns.clone(),
            None => data.columns().to_vec(),
        };
        let keys: Vec<&str> = columns.iter().map(String::as_str).collect();
        let missing = data.missing_columns(&keys);
        if !data.is_empty() && !missing.is_empty() {
            return Err(StepError::computation(
                self.name(),
                format!("key columns missing: {}", missing.join(", ")),
            ));
        }
        let data = data.dedup_by(&keys);
        if data.len() < before {
            info!(dropped = before - data.len(), "Dropped duplicate rows");
        }
        Ok(ctx.with_data(data))
    }

    fn validate(&self, ctx: &StepContext) -> Result<bool, StepError> {
        let data = ctx.data();
        if data.is_empty() {
            let requested = ctx
                .metadata()
                .get_opt(&DOWNLOAD_REPORT)?
                .map_or(0, |r| r.requested);
            if requested > 0 {
                warn!(requested, "No records available for the window");
                return Ok(false);
            }
            return Ok(true);
        }

        let missing = data.missing_columns(&[ENTITY_COLUMN, PERIOD_COLUMN]);
        if !missing.is_empty() {
            return Err(StepError::data_validation(
                self.name(),
                format!("missing columns: {}", missing.join(", ")),
            ));
        }
        for row in data.rows() {
            row_period(self.name(), row)?;
        }
        Ok(true)
    }

    async fn persist(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        let target = ctx.period();
        let repository = self.downloader.repository();
        let output = self.downloader.output_name();

        let mut by_period: BTreeMap<PeriodLabel, Dataset> = BTreeMap::new();
        for row in ctx.data().rows() {
            let period = row_period(self.name(), row)?;
            by_period.entry(period).or_default().push(row.clone());
        }

        for (period, part) in &by_period {
            let location = if *period == target {
                repository.write_tabular_latest(output, *period, part)?
            } else {
                repository.write_tabular(output, Some(*period), part)?
            };
            self.manifest
                .register(self.name(), &self.output_key(*period, target), Some(*period), location)?;
        }

        let report = ctx.metadata().get(&DOWNLOAD_REPORT)?;
        if !report.failed.is_empty() {
            return Err(StepError::IncompleteDownload {
                failed: report.failed,
            });
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::dataset::Row;
    use crate::download::egress::EgressPath;
    use crate::download::fetcher::RecordFetcher;
    use crate::download::LedgerKey;
    use crate::errors::FetchError;
    use crate::step::{StepRunner, StepState};
    use crate::storage::{InMemoryRepository, KeyValueStore, TabularStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct FlakyFetcher {
        broken: Vec<String>,
    }

    #[async_trait]
    impl RecordFetcher for FlakyFetcher {
        async fn fetch(&self, key: &LedgerKey, _egress: &EgressPath) -> Result<Vec<Row>, FetchError> {
            if self.broken.contains(&key.entity_id) {
                return Err(FetchError::Transient("503 from upstream".to_string()));
            }
            let mut row = Row::new();
            row.insert("altitude_m".to_string(), json!(120));
            Ok(vec![row])
        }
    }

    fn p(s: &str) -> PeriodLabel {
        s.parse().unwrap()
    }

    fn setup(broken: &[&str]) -> (Arc<InMemoryRepository>, Arc<PipelineManifest>, Downloader) {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = Arc::new(PipelineManifest::load(repo.clone()).unwrap());
        let fetcher = Arc::new(FlakyFetcher {
            broken: broken.iter().map(ToString::to_string).collect(),
        });
        let downloader = Downloader::new("weather", "altitude_data", repo.clone(), fetcher)
            .with_config(DownloadConfig::new().with_batch_size(2).with_worker_concurrency(2));
        (repo, manifest, downloader)
    }

    fn fixed(ids: &[&str]) -> EntitySource {
        EntitySource::Fixed(ids.iter().map(ToString::to_string).collect())
    }

    #[tokio::test]
    async fn test_incomplete_download_lists_failed_entity() {
        let (repo, manifest, downloader) = setup(&["store-2"]);
        let step = DownloadStep::new(downloader, fixed(&["store-1", "store-2", "store-3"]), manifest.clone())
            .with_history(2);

        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509B")))
            .await;

        assert_eq!(run.state, StepState::Failed);
        let Some(StepError::IncompleteDownload { failed }) = run.error else {
            panic!("expected IncompleteDownload, got {:?}", run.error);
        };
        assert_eq!(
            failed,
            vec![
                LedgerKey::new("store-2", p("202509A")),
                LedgerKey::new("store-2", p("202509B"))
            ]
        );

        // Everything that was fetched is durable and registered.
        let outputs = manifest.all_outputs("weather");
        assert_eq!(
            outputs.keys().cloned().collect::<Vec<_>>(),
            vec!["altitude_data".to_string(), "altitude_data_202509A".to_string()]
        );
        assert_eq!(
            repo.read_tabular("altitude_data", Some(p("202509B")), &[]).unwrap().len(),
            2
        );
        assert_eq!(repo.read_progress("weather").unwrap().summary().failed, 2);
    }

    #[tokio::test]
    async fn test_entities_from_upstream_dataset() {
        let (repo, manifest, downloader) = setup(&[]);
        let stores = Dataset::from_rows(vec![
            [("store_id".to_string(), json!("s1"))].into_iter().collect(),
            [("store_id".to_string(), json!(42))].into_iter().collect(),
        ]);
        repo.write_tabular("stores", None, &stores).unwrap();

        let step = DownloadStep::new(downloader, EntitySource::dataset("stores", "store_id"), manifest.clone());
        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509A")))
            .await;

        assert!(run.is_success(), "{:?}", run.error);
        let ctx = run.context.unwrap();
        let report = ctx.metadata().get(&DOWNLOAD_REPORT).unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(ctx.data().len(), 2);
        assert_eq!(
            manifest.lookup("weather", "altitude_data", Some(p("202509A"))).unwrap(),
            "memory://altitude_data_202509A.jsonl"
        );
        // The target period also refreshes the generic copy.
        assert!(repo.location_exists("memory://altitude_data.jsonl"));
    }

    #[tokio::test]
    async fn test_missing_entity_dataset_is_missing_input() {
        let (_repo, manifest, downloader) = setup(&[]);
        let step = DownloadStep::new(downloader, EntitySource::dataset("stores", "store_id"), manifest);

        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509A")))
            .await;
        assert!(matches!(run.error, Some(StepError::MissingInput { ref input, .. }) if input == "stores"));
    }

    #[tokio::test]
    async fn test_rows_duplicated_by_a_crash_are_dropped() {
        let (repo, manifest, downloader) = setup(&[]);
        // A previous run appended s1's rows but died before its checkpoint.
        let mut stale = Row::new();
        stale.insert("altitude_m".to_string(), json!(120));
        stale.insert(ENTITY_COLUMN.to_string(), json!("s1"));
        stale.insert(PERIOD_COLUMN.to_string(), json!("202509A"));
        repo.append_tabular("altitude_data", Some(p("202509A")), &[stale]).unwrap();

        let step = DownloadStep::new(downloader, fixed(&["s1", "s2"]), manifest);
        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509A")))
            .await;

        assert!(run.is_success());
        let stored = repo.read_tabular("altitude_data", Some(p("202509A")), &[]).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (repo, manifest, downloader) = setup(&[]);
        let step = DownloadStep::new(downloader, fixed(&["s1"]), manifest.clone());
        let runner = StepRunner::default();

        assert!(runner.run(&step, StepContext::new(p("202509A"))).await.is_success());
        let second = runner.run(&step, StepContext::new(p("202509A"))).await;

        assert!(second.is_success());
        let report = second.context.unwrap().metadata().get(&DOWNLOAD_REPORT).unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.skipped_done, 1);
        assert_eq!(manifest.all_outputs("weather").len(), 1);
        assert_eq!(repo.read_tabular("altitude_data", Some(p("202509A")), &[]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_entity_set_is_noop_success() {
        let (_repo, manifest, downloader) = setup(&[]);
        let step = DownloadStep::new(downloader, fixed(&[]), manifest.clone());

        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509A")))
            .await;

        assert!(run.is_success());
        assert_eq!(run.signal, crate::step::ResultSignal::Success);
        assert!(manifest.all_outputs("weather").is_empty());
    }

    /// Echoes the upstream's own, differently formatted key columns.
    struct RemoteKeysFetcher;

    #[async_trait]
    impl RecordFetcher for RemoteKeysFetcher {
        async fn fetch(&self, _key: &LedgerKey, _egress: &EgressPath) -> Result<Vec<Row>, FetchError> {
            let mut row = Row::new();
            row.insert(ENTITY_COLUMN.to_string(), json!("remote-42"));
            row.insert(PERIOD_COLUMN.to_string(), json!("2025-09-01"));
            row.insert("altitude_m".to_string(), json!(80));
            Ok(vec![row])
        }
    }

    #[tokio::test]
    async fn test_remote_key_columns_are_overwritten() {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = Arc::new(PipelineManifest::load(repo.clone()).unwrap());
        let downloader = Downloader::new("weather", "altitude_data", repo.clone(), Arc::new(RemoteKeysFetcher));
        let step = DownloadStep::new(downloader, fixed(&["s1", "s2"]), manifest);

        let run = StepRunner::default()
            .run(&step, StepContext::new(p("202509A")))
            .await;

        assert!(run.is_success(), "{:?}", run.error);
        let stored = repo.read_tabular("altitude_data", Some(p("202509A")), &[]).unwrap();
        let mut keys: Vec<(&str, &str)> = stored
            .rows()
            .iter()
            .map(|r| (r[ENTITY_COLUMN].as_str().unwrap(), r[PERIOD_COLUMN].as_str().unwrap()))
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![("s1", "202509A"), ("s2", "202509A")]);
    }

    #[test]
    fn test_periods_window() {
        let (_repo, manifest, downloader) = setup(&[]);
        let step = DownloadStep::new(downloader, fixed(&[]), manifest).with_history(3);
        let labels: Vec<String> = step
            .periods_for(p("202601A"))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(labels, vec!["202512A", "202512B", "202601A"]);
        assert!(step.with_history(0).periods_for(p("202601A")).is_empty());
    }
}
