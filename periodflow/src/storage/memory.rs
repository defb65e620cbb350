//! In-memory repository with the same resolution rules as the filesystem one.

use super::naming::{candidate_names, generic_file_name, parse_artifact_name, period_file_name};
use super::{check_schema, DocumentStore, KeyValueStore, TabularStore, TABULAR_EXTENSION};
use crate::dataset::{Dataset, Row};
use crate::errors::StorageError;
use crate::period::PeriodLabel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

const SCHEME: &str = "memory://";

/// A repository that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: DashMap<String, Vec<Row>>,
    documents: DashMap<String, serde_json::Value>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tabular artifacts.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn location(file_name: &str) -> String {
        format!("{SCHEME}{file_name}")
    }

    fn file_name(logical_name: &str, period: Option<PeriodLabel>) -> String {
        match period {
            Some(period) => period_file_name(logical_name, period, TABULAR_EXTENSION),
            None => generic_file_name(logical_name, TABULAR_EXTENSION),
        }
    }
}

impl TabularStore for InMemoryRepository {
    fn resolve(&self, logical_name: &str, period: Option<PeriodLabel>) -> Result<String, StorageError> {
        let candidates = candidate_names(logical_name, period, TABULAR_EXTENSION);
        candidates
            .iter()
            .find(|name| self.tables.contains_key(*name))
            .map(|name| Self::location(name))
            .ok_or_else(|| {
                StorageError::not_found(
                    logical_name,
                    period,
                    candidates.iter().map(|n| Self::location(n)).collect(),
                )
            })
    }

    fn read_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        required: &[&str],
    ) -> Result<Dataset, StorageError> {
        let location = self.resolve(logical_name, period)?;
        let key = location.trim_start_matches(SCHEME);
        let rows = self
            .tables
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::not_found(logical_name, period, vec![location.clone()]))?;
        check_schema(logical_name, Dataset::from_rows(rows), required)
    }

    fn write_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        dataset: &Dataset,
    ) -> Result<String, StorageError> {
        let name = Self::file_name(logical_name, period);
        self.tables.insert(name.clone(), dataset.rows().to_vec());
        Ok(Self::location(&name))
    }

    fn append_tabular(
        &self,
        logical_name: &str,
        period: Option<PeriodLabel>,
        rows: &[Row],
    ) -> Result<String, StorageError> {
        let name = Self::file_name(logical_name, period);
        self.tables
            .entry(name.clone())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(Self::location(&name))
    }

    fn list_periods(&self, logical_name: &str) -> Result<Vec<PeriodLabel>, StorageError> {
        let mut periods: Vec<PeriodLabel> = self
            .tables
            .iter()
            .filter_map(|entry| parse_artifact_name(entry.key()))
            .filter(|name| name.dataset == logical_name)
            .filter_map(|name| name.period)
            .collect();
        periods.sort();
        Ok(periods)
    }

    fn location_exists(&self, location: &str) -> bool {
        location
            .strip_prefix(SCHEME)
            .is_some_and(|name| self.tables.contains_key(name) || self.documents.contains_key(name))
    }
}

impl DocumentStore for InMemoryRepository {
    fn read_document(&self, name: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.documents.get(name).map(|d| d.value().clone()))
    }

    fn write_document(&self, name: &str, value: &serde_json::Value) -> Result<String, StorageError> {
        self.documents.insert(name.to_string(), value.clone());
        Ok(Self::location(name))
    }

    fn update_document(
        &self,
        name: &str,
        update: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StorageError>,
    ) -> Result<serde_json::Value, StorageError> {
        // The entry guard holds the shard lock for the whole update.
        match self.documents.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let value = update(Some(occupied.get().clone()))?;
                occupied.insert(value.clone());
                Ok(value)
            }
            Entry::Vacant(vacant) => {
                let value = update(None)?;
                vacant.insert(value.clone());
                Ok(value)
            }
        }
    }
}

impl KeyValueStore for InMemoryRepository {}
