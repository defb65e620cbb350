//! In-memory tabular dataset handed between step phases.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A single record, keyed by column name.
pub type Row = BTreeMap<String, serde_json::Value>;

/// An ordered collection of rows with a declared column list.
///
/// The column list is the union of all keys seen, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Dataset {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dataset from rows, deriving the column list.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut dataset = Self::new();
        dataset.extend(rows);
        dataset
    }

    /// Declares a column without adding any rows.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column);
        }
        self
    }

    /// Appends a row.
    pub fn push(&mut self, row: Row) {
        for key in row.keys() {
            if !self.columns.iter().any(|c| c == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    /// Appends many rows.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            self.push(row);
        }
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the dataset, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the required columns that are not present.
    #[must_use]
    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| !self.columns.iter().any(|have| have == *c))
            .map(|c| (*c).to_string())
            .collect()
    }

    /// Keeps the last row for each distinct combination of `key_columns`.
    ///
    /// Row order follows the position of each key's first occurrence.
    #[must_use]
    pub fn dedup_by(self, key_columns: &[&str]) -> Self {
        let key_of = |row: &Row| -> String {
            key_columns
                .iter()
                .map(|c| row.get(*c).map(ToString::to_string).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\u{1f}")
        };

        let mut latest: BTreeMap<String, Row> = BTreeMap::new();
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for row in self.rows {
            let key = key_of(&row);
            if seen.insert(key.clone()) {
                order.push(key.clone());
            }
            latest.insert(key, row);
        }

        let rows = order
            .into_iter()
            .filter_map(|key| latest.remove(&key))
            .collect();
        Self {
            columns: self.columns,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_columns_follow_first_seen_order() {
        let mut ds = Dataset::new().with_column("store");
        ds.push(row(&[("store", json!("s1")), ("temp", json!(21.5))]));
        ds.push(row(&[("humidity", json!(40))]));
        assert_eq!(ds.columns(), &["store", "temp", "humidity"]);
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn test_missing_columns() {
        let ds = Dataset::from_rows(vec![row(&[("store", json!("s1"))])]);
        assert_eq!(ds.missing_columns(&["store", "period"]), vec!["period".to_string()]);
        assert!(ds.missing_columns(&["store"]).is_empty());
    }

    #[test]
    fn test_dedup_keeps_last_per_key() {
        let ds = Dataset::from_rows(vec![
            row(&[("entity_id", json!("a")), ("v", json!(1))]),
            row(&[("entity_id", json!("b")), ("v", json!(2))]),
            row(&[("entity_id", json!("a")), ("v", json!(3))]),
        ])
        .dedup_by(&["entity_id"]);

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows()[0].get("v"), Some(&json!(3)));
        assert_eq!(ds.rows()[1].get("v"), Some(&json!(2)));
    }
}
