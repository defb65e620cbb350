//! Durable storage behind a capability-set abstraction.
//!
//! A repository exposes three capabilities:
//!
//! - [`TabularStore`]: period-versioned tabular datasets with generic fallback
//! - [`DocumentStore`]: whole JSON documents written atomically
//! - [`KeyValueStore`]: per-stage progress ledgers kept in one document
//!
//! Every low-level failure is reported as a [`StorageError`]; callers never
//! see raw I/O or decoder errors.

pub mod atomic;
mod fs;
mod memory;
pub mod naming;

pub use fs::FsRepository;
pub use memory::InMemoryRepository;

use crate::dataset::{Dataset, Row};
use crate::download::ProgressLedger;
use crate::errors::StorageError;
use crate::period::PeriodLabel;
use std::collections::BTreeMap;

/// Default file extension for tabular artifacts (JSON Lines).
pub const TABULAR_EXTENSION: &str = "jsonl";

/// Default document name holding every stage's progress ledger.
pub const DEFAULT_LEDGER_DOCUMENT: &str = "download_progress";

/// Period-versioned tabular datasets.
pub trait TabularStore: Send + Sync {
    /// Resolves a logical name to a physical location.
    ///
    /// Tries the period-specific artifact first, then the generic one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if neither exists.
    fn resolve(&self, logical_name: &str, period: Option<PeriodLabel>) -> Result<String, StorageError>;

    /// Resolves and loads a dataset, checking that `required` columns exist.
    ///
    /// Empty artifacts carry no column information and skip the check.
    ///
    /// # Errors
    ///
    /// `NotFound` if no artifact exists, `Schema` if required columns are absent.
    fn read_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        required: &[&str],
    ) -> Result<Dataset, StorageError>;

    /// Writes a dataset to the period-specific name, or to the generic name
    /// when `period` is `None`. Returns the physical location.
    ///
    /// Writing a period never touches the generic artifact.
    fn write_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        dataset: &Dataset,
    ) -> Result<String, StorageError>;

    /// Appends rows to the period-specific (or generic) artifact.
    fn append_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        rows: &[Row],
    ) -> Result<String, StorageError>;

    /// Periods for which a period-specific artifact exists, ascending.
    fn list_periods(&self, logical_name: &str) -> Result<Vec<PeriodLabel>, StorageError>;

    /// Returns true if the physical location exists.
    fn location_exists(&self, location: &str) -> bool;

    /// Writes the period-specific artifact and then refreshes the generic
    /// "latest" copy. Returns the period-specific location.
    fn write_tabular_latest(
        &self,
        logical_name: &str,
        period: PeriodLabel,
        dataset: &Dataset,
    ) -> Result<String, StorageError> {
        let location = self.write_tabular(logical_name, Some(period), dataset)?;
        self.write_tabular(logical_name, None, dataset)?;
        Ok(location)
    }

    /// Loads the newest period-specific artifact at or before `period`.
    fn read_latest_at_or_before(
        &self,
        logical_name: &str,
        period: PeriodLabel,
        required: &[&str],
    ) -> Result<(PeriodLabel, Dataset), StorageError> {
        let found = self
            .list_periods(logical_name)?
            .into_iter()
            .filter(|p| *p <= period)
            .max()
            .ok_or_else(|| StorageError::not_found(logical_name, Some(period), Vec::new()))?;
        let dataset = self.read_tabular(logical_name, Some(found), required)?;
        Ok((found, dataset))
    }
}

/// Whole JSON documents.
pub trait DocumentStore: Send + Sync {
    /// Reads a document, or `None` if it does not exist.
    fn read_document(&self, name: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Replaces a document atomically. Returns the physical location.
    fn write_document(&self, name: &str, value: &serde_json::Value) -> Result<String, StorageError>;

    /// Read-modify-write of one document, exclusive against every other
    /// writer of the same document, including other processes.
    ///
    /// `update` receives the current value (`None` if absent) and returns
    /// the value to store. Returns the stored value.
    fn update_document(
        &self,
        name: &str,
        update: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StorageError>,
    ) -> Result<serde_json::Value, StorageError>;
}

/// Per-stage progress ledgers, stored together in a single document keyed
/// by stage name.
pub trait KeyValueStore: DocumentStore {
    /// Name of the document holding all ledgers.
    fn ledger_document(&self) -> &str {
        DEFAULT_LEDGER_DOCUMENT
    }

    /// Loads the ledger for `key`, empty if none was ever written.
    fn read_progress(&self, key: &str) -> Result<ProgressLedger, StorageError> {
        let document = self.read_document(self.ledger_document())?;
        let Some(section) = document.as_ref().and_then(|d| d.get(key)) else {
            return Ok(ProgressLedger::new());
        };
        serde_json::from_value(section.clone())
            .map_err(|e| StorageError::serialization(format!("decoding ledger '{key}'"), e))
    }

    /// Merges `ledger` into the stored ledger for `key` and returns the
    /// merged ledger.
    ///
    /// Stored pairs absent from `ledger` are kept, so runs of one stage over
    /// different pairs never erase each other's progress. Pairs present on
    /// both sides are resolved by [`ProgressLedger::merge`]. Other stages'
    /// ledgers are untouched.
    fn write_progress(&self, key: &str, ledger: &ProgressLedger) -> Result<ProgressLedger, StorageError> {
        let mut merged = ProgressLedger::new();
        self.update_document(self.ledger_document(), &mut |current| {
            let mut sections: BTreeMap<String, serde_json::Value> = match current {
                Some(doc) => serde_json::from_value(doc)
                    .map_err(|e| StorageError::serialization("decoding ledger document", e))?,
                None => BTreeMap::new(),
            };
            let mut stored: ProgressLedger = match sections.remove(key) {
                Some(section) => serde_json::from_value(section)
                    .map_err(|e| StorageError::serialization(format!("decoding ledger '{key}'"), e))?,
                None => ProgressLedger::new(),
            };
            stored.merge(ledger);
            let encoded = serde_json::to_value(&stored)
                .map_err(|e| StorageError::serialization(format!("encoding ledger '{key}'"), e))?;
            sections.insert(key.to_string(), encoded);
            merged = stored;
            serde_json::to_value(sections)
                .map_err(|e| StorageError::serialization("encoding ledger document", e))
        })?;
        Ok(merged)
    }
}

/// The full capability set a stage works against.
pub trait Repository: TabularStore + KeyValueStore {}

impl<T: TabularStore + KeyValueStore> Repository for T {}

pub(crate) fn encode_rows(rows: &[Row]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut out, row)
            .map_err(|e| StorageError::serialization("encoding row", e))?;
        out.push(b'\n');
    }
    Ok(out)
}

pub(crate) fn decode_rows(location: &str, text: &str) -> Result<Vec<Row>, StorageError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                StorageError::serialization(format!("decoding {location} line {}", n + 1), e)
            })
        })
        .collect()
}

pub(crate) fn check_schema(
    logical_name: &str,
    dataset: Dataset,
    required: &[&str],
) -> Result<Dataset, StorageError> {
    if dataset.is_empty() {
        return Ok(dataset);
    }
    let missing = dataset.missing_columns(required);
    if missing.is_empty() {
        Ok(dataset)
    } else {
        Err(StorageError::schema(logical_name, missing))
    }
}
