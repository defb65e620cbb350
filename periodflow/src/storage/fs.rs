//! Filesystem-backed repository.

use super::atomic::{append_synced, write_atomic, write_json_atomic, FileLock};
use super::naming::{candidate_names, generic_file_name, parse_artifact_name, period_file_name};
use super::{
    check_schema, decode_rows, encode_rows, DocumentStore, KeyValueStore, TabularStore,
    DEFAULT_LEDGER_DOCUMENT, TABULAR_EXTENSION,
};
use crate::dataset::{Dataset, Row};
use crate::errors::StorageError;
use crate::period::PeriodLabel;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// A repository rooted at an input and an output directory.
///
/// Reads search the output root first and then the input root; writes
/// always go to the output root.
#[derive(Debug)]
pub struct FsRepository {
    input_root: PathBuf,
    output_root: PathBuf,
    extension: String,
    ledger_document: String,
    lock_timeout: Duration,
}

/// How long a document update waits for another writer by default.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

impl FsRepository {
    /// Creates a repository where input and output share one root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::with_roots(root.clone(), root)
    }

    /// Creates a repository with separate input and output roots.
    #[must_use]
    pub fn with_roots(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            extension: TABULAR_EXTENSION.to_string(),
            ledger_document: DEFAULT_LEDGER_DOCUMENT.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Overrides the tabular file extension.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Overrides the ledger document name.
    #[must_use]
    pub fn with_ledger_document(mut self, name: impl Into<String>) -> Self {
        self.ledger_document = name.into();
        self
    }

    /// Overrides how long document updates wait for a concurrent writer.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The output root.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    fn roots(&self) -> Vec<&Path> {
        if self.input_root == self.output_root {
            vec![self.output_root.as_path()]
        } else {
            vec![self.output_root.as_path(), self.input_root.as_path()]
        }
    }

    fn write_path(&self, logical_name: &str, period: Option<PeriodLabel>) -> PathBuf {
        let file_name = match period {
            Some(period) => period_file_name(logical_name, period, &self.extension),
            None => generic_file_name(logical_name, &self.extension),
        };
        self.output_root.join(file_name)
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.output_root.join(format!("{name}.json"))
    }
}

fn location_of(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl TabularStore for FsRepository {
    fn resolve(&self, logical_name: &str, period: Option<PeriodLabel>) -> Result<String, StorageError> {
        let mut tried = Vec::new();
        for name in candidate_names(logical_name, period, &self.extension) {
            for root in self.roots() {
                let path = root.join(&name);
                if path.is_file() {
                    debug!(logical_name, location = %path.display(), "Resolved artifact");
                    return Ok(location_of(&path));
                }
                tried.push(location_of(&path));
            }
        }
        Err(StorageError::not_found(logical_name, period, tried))
    }

    fn read_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        required: &[&str],
    ) -> Result<Dataset, StorageError> {
        let location = self.resolve(logical_name, period)?;
        let text = fs::read_to_string(&location)
            .map_err(|e| StorageError::io(format!("reading {location}"), e))?;
        let dataset = Dataset::from_rows(decode_rows(&location, &text)?);
        check_schema(logical_name, dataset, required)
    }

    fn write_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        dataset: &Dataset,
    ) -> Result<String, StorageError> {
        let path = self.write_path(logical_name, period);
        write_atomic(&path, &encode_rows(dataset.rows())?)?;
        debug!(logical_name, rows = dataset.len(), location = %path.display(), "Wrote dataset");
        Ok(location_of(&path))
    }

    fn append_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        rows: &[Row],
    ) -> Result<String, StorageError> {
        let path = self.write_path(logical_name, period);
        append_synced(&path, &encode_rows(rows)?)?;
        Ok(location_of(&path))
    }

    fn list_periods(&self, logical_name: &str) -> Result<Vec<PeriodLabel>, StorageError> {
        let mut periods = Vec::new();
        for root in self.roots() {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(format!("listing {}", root.display()), e)),
            };
            for entry in entries.filter_map(Result::ok) {
                let file_name = entry.file_name();
                let Some(name) = parse_artifact_name(&file_name.to_string_lossy()) else {
                    continue;
                };
                if name.dataset == logical_name && name.extension == self.extension {
                    if let Some(period) = name.period {
                        periods.push(period);
                    }
                }
            }
        }
        periods.sort();
        periods.dedup();
        Ok(periods)
    }

    fn location_exists(&self, location: &str) -> bool {
        Path::new(location).exists()
    }
}

impl DocumentStore for FsRepository {
    fn read_document(&self, name: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let path = self.document_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(format!("reading {}", path.display()), e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StorageError::serialization(format!("decoding {}", path.display()), e))
    }

    fn write_document(&self, name: &str, value: &serde_json::Value) -> Result<String, StorageError> {
        let path = self.document_path(name);
        write_json_atomic(&path, value)?;
        Ok(location_of(&path))
    }

    fn update_document(
        &self,
        name: &str,
        update: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StorageError>,
    ) -> Result<serde_json::Value, StorageError> {
        let path = self.document_path(name);
        let _lock = FileLock::acquire(&path, self.lock_timeout)?;
        let value = update(self.read_document(name)?)?;
        write_json_atomic(&path, &value)?;
        Ok(value)
    }
}

impl KeyValueStore for FsRepository {
    fn ledger_document(&self) -> &str {
        &self.ledger_document
    }
}
