//! Progress ledger for resumable downloads.
//!
//! Each `(entity, period)` pair moves through a bounded state machine:
//!
//! ```text
//! pending --ok--> done
//! pending --err, attempts < ceiling--> pending
//! pending --err, attempts >= ceiling--> failed
//! failed  --ceiling raised--> pending (on the next resume)
//! ```
//!
//! `done` is terminal. The serialized form is a map from
//! `"<entity_id>:<period_label>"` to `{status, attempts, last_error}`.

use crate::period::PeriodLabel;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifies one unit of download work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerKey {
    /// The entity (e.g. a store location) being fetched.
    pub entity_id: String,
    /// The period being fetched.
    pub period: PeriodLabel,
}

impl LedgerKey {
    /// Creates a key.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, period: PeriodLabel) -> Self {
        Self {
            entity_id: entity_id.into(),
            period,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.period)
    }
}

impl FromStr for LedgerKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Entity ids may themselves contain ':'; the period never does.
        let (entity, period) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("ledger key '{s}' has no ':' separator"))?;
        if entity.is_empty() {
            return Err(format!("ledger key '{s}' has an empty entity id"));
        }
        let period = period.parse::<PeriodLabel>().map_err(|e| e.to_string())?;
        Ok(Self::new(entity, period))
    }
}

impl Serialize for LedgerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LedgerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Status of one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Not fetched yet, or failed with attempts remaining.
    Pending,
    /// Fetched and flushed.
    Done,
    /// Reached the attempt ceiling.
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress for one `(entity, period)` pair.
///
/// `attempts` counts fetches that failed on their own merit: transient and
/// permanent errors. A rate-limit response only records `last_error`. It
/// reflects throttling of the egress path rather than a problem with the
/// pair, and the downloader already bounds it through egress rotation, so
/// counting it would fail healthy pairs whenever the service throttles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Current status.
    pub status: EntryStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Last error message, if any attempt failed.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LedgerEntry {
    /// A fresh pending entry.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            status: EntryStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Returns true if the entry should be attempted under `ceiling`.
    #[must_use]
    pub const fn is_retryable(&self, ceiling: u32) -> bool {
        match self.status {
            EntryStatus::Done => false,
            EntryStatus::Pending | EntryStatus::Failed => self.attempts < ceiling,
        }
    }

    /// Marks the entry done. `done` is terminal.
    pub fn mark_done(&mut self) {
        self.status = EntryStatus::Done;
        self.last_error = None;
    }

    /// Records a failed attempt and settles the status against `ceiling`.
    pub fn record_failure(&mut self, error: impl Into<String>, ceiling: u32) {
        if self.status == EntryStatus::Done {
            return;
        }
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.status = if self.attempts >= ceiling {
            EntryStatus::Failed
        } else {
            EntryStatus::Pending
        };
    }

    /// Records a rate-limited fetch. The attempt is not counted.
    pub fn record_rate_limited(&mut self, error: impl Into<String>) {
        if self.status == EntryStatus::Done {
            return;
        }
        self.last_error = Some(error.into());
    }

    /// Returns true if `self` should replace `stored` when two writers
    /// report the same pair.
    ///
    /// A stored `done` is never downgraded. Otherwise `done` wins, then the
    /// entry with more recorded attempts, and `self` on a tie.
    #[must_use]
    pub fn supersedes(&self, stored: &Self) -> bool {
        match (self.status, stored.status) {
            (_, EntryStatus::Done) => false,
            (EntryStatus::Done, _) => true,
            _ => self.attempts >= stored.attempts,
        }
    }

    /// Records a failure that will never succeed, consuming every remaining attempt.
    pub fn record_permanent_failure(&mut self, error: impl Into<String>, ceiling: u32) {
        if self.status == EntryStatus::Done {
            return;
        }
        self.attempts = self.attempts.saturating_add(1).max(ceiling);
        self.last_error = Some(error.into());
        self.status = EntryStatus::Failed;
    }
}

/// Counts of entries per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Pending entries.
    pub pending: usize,
    /// Done entries.
    pub done: usize,
    /// Failed entries.
    pub failed: usize,
}

/// Progress for every pair a download step knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressLedger {
    entries: BTreeMap<LedgerKey, LedgerEntry>,
}

impl ProgressLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, key: LedgerKey, entry: LedgerEntry) {
        self.entries.insert(key, entry);
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, key: &LedgerKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    /// Mutable access to an entry, creating a pending one if absent.
    pub fn entry_mut(&mut self, key: &LedgerKey) -> &mut LedgerEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(LedgerEntry::pending)
    }

    /// Adds pending entries for every `entity × period` pair not yet tracked.
    ///
    /// Duplicate entities or periods collapse onto the same key.
    pub fn seed<'a>(
        &mut self,
        entities: impl IntoIterator<Item = &'a str>,
        periods: &[PeriodLabel],
    ) -> usize {
        let mut added = 0;
        for entity in entities {
            for period in periods {
                let key = LedgerKey::new(entity, *period);
                if !self.entries.contains_key(&key) {
                    self.entries.insert(key, LedgerEntry::pending());
                    added += 1;
                }
            }
        }
        added
    }

    /// Folds `other` into this ledger, entry by entry.
    ///
    /// Entries only this ledger knows are kept. Shared entries are resolved
    /// with [`LedgerEntry::supersedes`].
    pub fn merge(&mut self, other: &Self) {
        for (key, incoming) in &other.entries {
            match self.entries.get_mut(key) {
                Some(stored) if !incoming.supersedes(stored) => {}
                Some(stored) => *stored = incoming.clone(),
                None => {
                    self.entries.insert(key.clone(), incoming.clone());
                }
            }
        }
    }

    /// A ledger holding only the tracked entries among `keys`.
    #[must_use]
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a LedgerKey>) -> Self {
        let entries = keys
            .into_iter()
            .filter_map(|key| self.entries.get(key).map(|entry| (key.clone(), entry.clone())))
            .collect();
        Self { entries }
    }

    /// Keys that still need work under `ceiling`, in key order.
    #[must_use]
    pub fn work_remaining(&self, ceiling: u32) -> Vec<LedgerKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_retryable(ceiling))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys that will not be retried under `ceiling` and are not done.
    #[must_use]
    pub fn permanently_failed(&self, ceiling: u32) -> Vec<LedgerKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status != EntryStatus::Done && !entry.is_retryable(ceiling))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Status counts.
    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for entry in self.entries.values() {
            match entry.status {
                EntryStatus::Pending => summary.pending += 1,
                EntryStatus::Done => summary.done += 1,
                EntryStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&LedgerKey, &LedgerEntry)> {
        self.entries.iter()
    }

    /// Number of tracked pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
