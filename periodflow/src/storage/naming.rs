//! Artifact naming convention.
//!
//! Two patterns coexist on disk:
//!
//! - `<dataset>_<YYYYMM><A|B>.<ext>`: the authoritative, period-specific copy
//! - `<dataset>.<ext>`: a generic "latest" convenience copy
//!
//! Resolution always prefers the period-specific name.

use crate::period::PeriodLabel;
use regex::Regex;
use std::sync::LazyLock;

static PERIOD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<dataset>.+)_(?P<period>\d{6}[AB])\.(?P<ext>[A-Za-z0-9]+)$")
        .expect("period artifact pattern is valid")
});

static GENERIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<dataset>[^/\\]+)\.(?P<ext>[A-Za-z0-9]+)$")
        .expect("generic artifact pattern is valid")
});

/// A parsed artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// Logical dataset name.
    pub dataset: String,
    /// Period, for period-specific artifacts.
    pub period: Option<PeriodLabel>,
    /// File extension without the dot.
    pub extension: String,
}

impl ArtifactName {
    /// Returns true for the `<dataset>.<ext>` form.
    #[must_use]
    pub const fn is_generic(&self) -> bool {
        self.period.is_none()
    }
}

/// `<dataset>_<period>.<ext>`
#[must_use]
pub fn period_file_name(dataset: &str, period: PeriodLabel, extension: &str) -> String {
    format!("{dataset}_{period}.{extension}")
}

/// `<dataset>.<ext>`
#[must_use]
pub fn generic_file_name(dataset: &str, extension: &str) -> String {
    format!("{dataset}.{extension}")
}

/// Physical names to try for a lookup, most specific first.
#[must_use]
pub fn candidate_names(dataset: &str, period: Option<PeriodLabel>, extension: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(2);
    if let Some(period) = period {
        names.push(period_file_name(dataset, period, extension));
    }
    names.push(generic_file_name(dataset, extension));
    names
}

/// Parses a file name in either naming pattern.
///
/// A name whose suffix looks like a period but does not parse as one
/// (e.g. month 13) is treated as a generic artifact.
#[must_use]
pub fn parse_artifact_name(file_name: &str) -> Option<ArtifactName> {
    if let Some(caps) = PERIOD_PATTERN.captures(file_name) {
        if let Ok(period) = PeriodLabel::parse(&caps["period"]) {
            return Some(ArtifactName {
                dataset: caps["dataset"].to_string(),
                period: Some(period),
                extension: caps["ext"].to_string(),
            });
        }
    }

    GENERIC_PATTERN.captures(file_name).map(|caps| ArtifactName {
        dataset: caps["dataset"].to_string(),
        period: None,
        extension: caps["ext"].to_string(),
    })
}
