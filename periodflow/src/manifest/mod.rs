//! Persisted registry of stage outputs.
//!
//! The manifest document maps stage name to output key to
//! `{file_path, period_label, created_at}`. Downstream stages and
//! verification tooling read it to locate artifacts without hardcoding
//! file names.
//!
//! Every registration is flushed before `register` returns, so a crash
//! loses at most the in-flight stage's own registrations. A flush re-reads
//! the stored document and changes only the touched key, so manifests
//! loaded separately over the same document do not overwrite each other.

use crate::errors::{ManifestError, StorageError};
use crate::period::PeriodLabel;
use crate::storage::{DocumentStore, TabularStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default manifest document name.
pub const DEFAULT_MANIFEST_DOCUMENT: &str = "pipeline_manifest";

/// One registered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The producing stage.
    #[serde(skip)]
    pub stage: String,
    /// The output key within the stage.
    #[serde(skip)]
    pub output_key: String,
    /// The period the output belongs to, if any.
    #[serde(rename = "period_label")]
    pub period: Option<PeriodLabel>,
    /// Where the artifact lives.
    #[serde(rename = "file_path")]
    pub physical_location: String,
    /// When it was registered.
    pub created_at: DateTime<Utc>,
}

type StageOutputs = BTreeMap<String, ManifestEntry>;

/// The registry of everything the pipeline has produced.
///
/// Entries are keyed by `(stage, output_key)`. Re-registering a key
/// replaces the previous entry.
pub struct PipelineManifest {
    store: Arc<dyn DocumentStore>,
    document: String,
    entries: Mutex<BTreeMap<String, StageOutputs>>,
}

impl std::fmt::Debug for PipelineManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManifest")
            .field("document", &self.document)
            .field("stages", &self.entries.lock().len())
            .finish()
    }
}

impl PipelineManifest {
    /// Loads the manifest from `store`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the document exists but cannot be read or decoded.
    pub fn load(store: Arc<dyn DocumentStore>) -> Result<Self, ManifestError> {
        Self::load_named(store, DEFAULT_MANIFEST_DOCUMENT)
    }

    /// Loads the manifest from a named document.
    pub fn load_named(
        store: Arc<dyn DocumentStore>,
        document: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        let document = document.into();
        let entries = decode_entries(store.read_document(&document)?, &document)?;

        info!(
            document = %document,
            stages = entries.len(),
            "Loaded pipeline manifest"
        );

        Ok(Self {
            store,
            document,
            entries: Mutex::new(entries),
        })
    }

    /// Applies `change` to the stored document under the store's update
    /// lock, then adopts the stored result as the in-memory view.
    fn flush_with<R>(
        &self,
        change: impl Fn(&mut BTreeMap<String, StageOutputs>) -> R,
    ) -> Result<R, ManifestError> {
        let mut entries = self.entries.lock();
        let mut merged = None;
        let mut outcome = None;
        self.store.update_document(&self.document, &mut |current| {
            let mut stored = decode_entries(current, &self.document)?;
            outcome = Some(change(&mut stored));
            let value = serde_json::to_value(&stored)
                .map_err(|e| StorageError::serialization("encoding manifest", e))?;
            merged = Some(stored);
            Ok(value)
        })?;
        if let Some(merged) = merged {
            *entries = merged;
        }
        outcome.ok_or_else(|| {
            StorageError::serialization("updating manifest", "update was not applied").into()
        })
    }

    /// Records an output, replacing any previous entry for the same key,
    /// and flushes before returning.
    ///
    /// If the flush fails nothing changes, in memory or on disk.
    pub fn register(
        &self,
        stage: &str,
        output_key: &str,
        period: Option<PeriodLabel>,
        location: impl Into<String>,
    ) -> Result<ManifestEntry, ManifestError> {
        let entry = ManifestEntry {
            stage: stage.to_string(),
            output_key: output_key.to_string(),
            period,
            physical_location: location.into(),
            created_at: Utc::now(),
        };

        self.flush_with(|stored| {
            stored
                .entry(stage.to_string())
                .or_default()
                .insert(output_key.to_string(), entry.clone());
        })?;

        debug!(
            stage,
            output_key,
            period = ?period,
            location = %entry.physical_location,
            "Registered output"
        );
        Ok(entry)
    }

    /// Location of a registered output.
    ///
    /// With `Some(period)`, the entry must have been registered for exactly
    /// that period. No generic fallback is applied here.
    pub fn lookup(
        &self,
        stage: &str,
        output_key: &str,
        period: Option<PeriodLabel>,
    ) -> Result<String, ManifestError> {
        let entries = self.entries.lock();
        entries
            .get(stage)
            .and_then(|outputs| outputs.get(output_key))
            .filter(|entry| period.is_none() || entry.period == period)
            .map(|entry| entry.physical_location.clone())
            .ok_or_else(|| ManifestError::NotFound {
                stage: stage.to_string(),
                output_key: output_key.to_string(),
                period,
            })
    }

    /// Every output registered by `stage`, keyed by output key.
    #[must_use]
    pub fn all_outputs(&self, stage: &str) -> BTreeMap<String, ManifestEntry> {
        self.entries.lock().get(stage).cloned().unwrap_or_default()
    }

    /// Returns true if `(stage, output_key)` is registered.
    #[must_use]
    pub fn contains(&self, stage: &str, output_key: &str) -> bool {
        self.entries
            .lock()
            .get(stage)
            .is_some_and(|outputs| outputs.contains_key(output_key))
    }

    /// Names of stages with at least one registration.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Drops every stored registration of `stage` and flushes.
    ///
    /// Returns the number of entries removed from the stored document.
    pub fn clear_stage(&self, stage: &str) -> Result<usize, ManifestError> {
        let removed = self.flush_with(|stored| stored.remove(stage).map_or(0, |outputs| outputs.len()))?;
        if removed > 0 {
            info!(stage, removed, "Cleared stage outputs");
        }
        Ok(removed)
    }

    /// Entries whose physical location no longer exists.
    #[must_use]
    pub fn verify(&self, store: &dyn TabularStore) -> Vec<ManifestEntry> {
        let missing: Vec<ManifestEntry> = self
            .entries
            .lock()
            .values()
            .flat_map(|outputs| outputs.values())
            .filter(|entry| !store.location_exists(&entry.physical_location))
            .cloned()
            .collect();
        for entry in &missing {
            warn!(
                stage = %entry.stage,
                output_key = %entry.output_key,
                location = %entry.physical_location,
                "Registered artifact is missing"
            );
        }
        missing
    }
}

/// Decodes a stored manifest, filling in the keys serde skips.
fn decode_entries(
    value: Option<serde_json::Value>,
    document: &str,
) -> Result<BTreeMap<String, StageOutputs>, StorageError> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    let mut entries: BTreeMap<String, StageOutputs> = serde_json::from_value(value)
        .map_err(|e| StorageError::serialization(format!("decoding manifest '{document}'"), e))?;
    for (stage, outputs) in &mut entries {
        for (key, entry) in outputs.iter_mut() {
            entry.stage.clone_from(stage);
            entry.output_key.clone_from(key);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsRepository, InMemoryRepository};
    use pretty_assertions::assert_eq;

    fn p(s: &str) -> PeriodLabel {
        s.parse().unwrap()
    }

    #[test]
    fn test_register_and_all_outputs() {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = PipelineManifest::load(repo).unwrap();
        manifest
            .register("weather", "altitude_data", Some(p("202509A")), "X")
            .unwrap();

        let outputs = manifest.all_outputs("weather");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["altitude_data"].physical_location, "X");
        assert_eq!(outputs["altitude_data"].period, Some(p("202509A")));
        assert!(manifest.all_outputs("sales").is_empty());
    }

    #[test]
    fn test_reregistration_overwrites() {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = PipelineManifest::load(repo).unwrap();
        let period = Some(p("202509A"));
        manifest.register("weather", "daily", period, "first").unwrap();
        manifest.register("weather", "daily", period, "second").unwrap();

        let outputs = manifest.all_outputs("weather");
        assert_eq!(outputs.len(), 1);
        assert_eq!(manifest.lookup("weather", "daily", period).unwrap(), "second");
    }

    #[test]
    fn test_lookup_requires_matching_period() {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = PipelineManifest::load(repo).unwrap();
        manifest.register("weather", "daily", Some(p("202509A")), "X").unwrap();

        assert!(manifest.lookup("weather", "daily", None).is_ok());
        assert!(matches!(
            manifest.lookup("weather", "daily", Some(p("202509B"))),
            Err(ManifestError::NotFound { .. })
        ));
        assert!(matches!(
            manifest.lookup("weather", "hourly", None),
            Err(ManifestError::NotFound { .. })
        ));
    }

    #[test]
    fn test_every_registration_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(FsRepository::new(dir.path()));
        {
            let manifest = PipelineManifest::load(repo.clone()).unwrap();
            manifest.register("sales", "clean", Some(p("202508B")), "/data/a").unwrap();
            manifest.register("weather", "daily", None, "/data/b").unwrap();
        }

        let reloaded = PipelineManifest::load(repo.clone()).unwrap();
        assert_eq!(reloaded.stages(), vec!["sales".to_string(), "weather".to_string()]);
        let entry = &reloaded.all_outputs("sales")["clean"];
        assert_eq!(entry.stage, "sales");
        assert_eq!(entry.output_key, "clean");
        assert_eq!(entry.physical_location, "/data/a");

        let raw = repo.read_document(DEFAULT_MANIFEST_DOCUMENT).unwrap().unwrap();
        assert_eq!(raw["sales"]["clean"]["file_path"], "/data/a");
        assert_eq!(raw["sales"]["clean"]["period_label"], "202508B");
        assert!(raw["weather"]["daily"]["period_label"].is_null());
        assert!(raw["sales"]["clean"].get("created_at").is_some());
    }

    #[test]
    fn test_clear_stage_and_verify() {
        let repo = Arc::new(InMemoryRepository::new());
        let manifest = PipelineManifest::load(repo.clone()).unwrap();
        let location = repo
            .write_tabular("sales", Some(p("202509A")), &crate::dataset::Dataset::new())
            .unwrap();
        manifest.register("sales", "clean", Some(p("202509A")), location).unwrap();
        manifest.register("sales", "ghost", None, "memory://nowhere.jsonl").unwrap();

        let missing = manifest.verify(repo.as_ref());
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].output_key, "ghost");

        assert_eq!(manifest.clear_stage("sales").unwrap(), 2);
        assert!(!manifest.contains("sales", "clean"));
        assert_eq!(manifest.clear_stage("sales").unwrap(), 0);
    }

    #[test]
    fn test_separate_manifests_keep_each_others_entries() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(FsRepository::new(dir.path()));
        let first = PipelineManifest::load(repo.clone()).unwrap();
        let second = PipelineManifest::load(repo.clone()).unwrap();

        first
            .register("weather", "weather_data_202509A", Some(p("202509A")), "/data/a")
            .unwrap();
        second
            .register("weather", "weather_data_202509B", Some(p("202509B")), "/data/b")
            .unwrap();

        let reloaded = PipelineManifest::load(repo).unwrap();
        let outputs = reloaded.all_outputs("weather");
        assert_eq!(
            outputs.keys().cloned().collect::<Vec<_>>(),
            vec!["weather_data_202509A".to_string(), "weather_data_202509B".to_string()]
        );
        // The writer's own view catches up with what is stored.
        assert!(second.contains("weather", "weather_data_202509A"));

        assert_eq!(first.clear_stage("weather").unwrap(), 2);
        assert!(PipelineManifest::load(Arc::new(FsRepository::new(dir.path())))
            .unwrap()
            .all_outputs("weather")
            .is_empty());
    }
}
