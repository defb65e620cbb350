//! Half-month reporting periods.
//!
//! A [`PeriodLabel`] is written `YYYYMM` followed by `A` (first half of the
//! month) or `B` (second half), e.g. `202508A`. Labels are totally ordered
//! and can be advanced by any number of half-periods in either direction.

use crate::errors::PeriodError;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Which half of the month a period covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Half {
    /// Days 1 to 15.
    A,
    /// Day 16 to month end.
    B,
}

impl Half {
    const fn index(self) -> i64 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    const fn from_index(index: i64) -> Self {
        if index == 0 {
            Self::A
        } else {
            Self::B
        }
    }
}

impl fmt::Display for Half {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Relative position of two periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOrder {
    /// `self` precedes `other`.
    Before,
    /// Same period.
    Same,
    /// `self` follows `other`.
    After,
}

impl From<Ordering> for PeriodOrder {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => Self::Before,
            Ordering::Equal => Self::Same,
            Ordering::Greater => Self::After,
        }
    }
}

/// A half-month reporting period.
///
/// Field order matters: the derived `Ord` compares `year_month` first and
/// then `half`, with `A < B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodLabel {
    year_month: u32,
    half: Half,
}

impl PeriodLabel {
    /// Builds a label from its parts.
    ///
    /// # Errors
    ///
    /// Returns `PeriodError::Format` if the month is outside `1..=12` or the
    /// year has more than four digits.
    pub fn from_parts(year: u32, month: u32, half: Half) -> Result<Self, PeriodError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodError::format(
                format!("{year:04}{month:02}{half}"),
                format!("month {month} is outside 1..=12"),
            ));
        }
        if year > 9999 {
            return Err(PeriodError::format(
                format!("{year}{month:02}{half}"),
                "year must have at most four digits",
            ));
        }
        Ok(Self {
            year_month: year * 100 + month,
            half,
        })
    }

    /// Parses a label such as `"202508A"`.
    ///
    /// # Errors
    ///
    /// Returns `PeriodError::Format` unless the input is exactly six ASCII
    /// digits forming a valid year-month followed by `A` or `B`.
    pub fn parse(input: &str) -> Result<Self, PeriodError> {
        if input.len() != 7 || !input.is_ascii() {
            return Err(PeriodError::format(
                input,
                "expected 6 digits followed by A or B",
            ));
        }

        let (digits, half) = input.split_at(6);
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PeriodError::format(input, "year-month must be 6 digits"));
        }
        let half = match half {
            "A" => Half::A,
            "B" => Half::B,
            other => {
                return Err(PeriodError::format(
                    input,
                    format!("half must be A or B, got '{other}'"),
                ))
            }
        };

        let year_month: u32 = digits
            .parse()
            .map_err(|_| PeriodError::format(input, "year-month is not a number"))?;
        Self::from_parts(year_month / 100, year_month % 100, half)
            .map_err(|_| PeriodError::format(input, "month must be 01..=12"))
    }

    /// The `YYYYMM` integer.
    #[must_use]
    pub const fn year_month(&self) -> u32 {
        self.year_month
    }

    /// The calendar year.
    #[must_use]
    pub const fn year(&self) -> u32 {
        self.year_month / 100
    }

    /// The calendar month, `1..=12`.
    #[must_use]
    pub const fn month(&self) -> u32 {
        self.year_month % 100
    }

    /// The half indicator.
    #[must_use]
    pub const fn half(&self) -> Half {
        self.half
    }

    /// Number of half-periods since January (A) of year zero.
    const fn ordinal(&self) -> i64 {
        let months = self.year() as i64 * 12 + (self.month() as i64 - 1);
        months * 2 + self.half.index()
    }

    /// Steps forward `n` half-periods (backward when `n` is negative).
    ///
    /// Results are clamped to the range representable by a four-digit year.
    #[must_use]
    pub fn advance(&self, n: i64) -> Self {
        const MAX_ORDINAL: i64 = (9999 * 12 + 11) * 2 + 1;
        let ordinal = self.ordinal().saturating_add(n).clamp(0, MAX_ORDINAL);
        let months = ordinal.div_euclid(2);
        let half = Half::from_index(ordinal.rem_euclid(2));
        let year = months.div_euclid(12);
        let month = months.rem_euclid(12) + 1;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let year_month = (year * 100 + month) as u32;
        Self { year_month, half }
    }

    /// Compares two labels.
    #[must_use]
    pub fn compare(&self, other: &Self) -> PeriodOrder {
        self.cmp(other).into()
    }

    /// Number of half-periods from `self` to `other` (negative if `other` is earlier).
    #[must_use]
    pub const fn distance_to(&self, other: &Self) -> i64 {
        other.ordinal() - self.ordinal()
    }

    /// `count` consecutive labels starting at `start`.
    #[must_use]
    pub fn range(start: Self, count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| start.advance(i64::try_from(i).unwrap_or(i64::MAX)))
            .collect()
    }

    /// First calendar day covered by the period.
    #[must_use]
    pub fn start_date(&self) -> NaiveDate {
        let day = match self.half {
            Half::A => 1,
            Half::B => 16,
        };
        // Year and month are validated at construction.
        NaiveDate::from_ymd_opt(self.year_i32(), self.month(), day).unwrap_or_default()
    }

    /// Last calendar day covered by the period.
    #[must_use]
    pub fn end_date(&self) -> NaiveDate {
        match self.half {
            Half::A => NaiveDate::from_ymd_opt(self.year_i32(), self.month(), 15).unwrap_or_default(),
            Half::B => {
                let (year, month) = if self.month() == 12 {
                    (self.year_i32() + 1, 1)
                } else {
                    (self.year_i32(), self.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|first| first.pred_opt())
                    .unwrap_or_default()
            }
        }
    }

    fn year_i32(&self) -> i32 {
        i32::try_from(self.year()).unwrap_or(i32::MAX)
    }
}

impl fmt::Display for PeriodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}{}", self.year_month, self.half)
    }
}

impl FromStr for PeriodLabel {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PeriodLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeriodLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PeriodLabel {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_valid() {
        let label = p("202508A");
        assert_eq!(label.year(), 2025);
        assert_eq!(label.month(), 8);
        assert_eq!(label.half(), Half::A);
        assert_eq!(label.to_string(), "202508A");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "202508", "202508C", "20250A", "2025088A", "202513A", "202500B", "2O2508A", "202508a"] {
            assert!(PeriodLabel::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_parse_rejects_surrounding_whitespace() {
        for bad in [" 202508A ", "202508A\n", "\t202508A"] {
            assert!(
                matches!(PeriodLabel::parse(bad), Err(PeriodError::Format { .. })),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_advance_within_month() {
        assert_eq!(p("202508A").advance(1), p("202508B"));
        assert_eq!(p("202508B").advance(-1), p("202508A"));
    }

    #[test]
    fn test_advance_rolls_year() {
        assert_eq!(p("202512B").advance(3), p("202602A"));
        assert_eq!(p("202601A").advance(-1), p("202512B"));
        assert_eq!(p("202501A").advance(-24), p("202401A"));
    }

    #[test]
    fn test_advance_identity_properties() {
        for year in [1999, 2024, 2025] {
            for month in 1..=12 {
                for half in [Half::A, Half::B] {
                    let label = PeriodLabel::from_parts(year, month, half).unwrap();
                    assert_eq!(label.advance(0), label);
                    assert_eq!(label.advance(2).advance(-2), label);
                    assert_eq!(label.advance(-7).advance(7), label);
                }
            }
        }
    }

    #[test]
    fn test_ordering() {
        assert!(p("202508A") < p("202508B"));
        assert!(p("202508B") < p("202509A"));
        assert!(p("202412B") < p("202501A"));
        assert_eq!(p("202508A").compare(&p("202508B")), PeriodOrder::Before);
        assert_eq!(p("202508B").compare(&p("202508B")), PeriodOrder::Same);
        assert_eq!(p("202509A").compare(&p("202508B")), PeriodOrder::After);
    }

    #[test]
    fn test_distance_and_range() {
        assert_eq!(p("202512B").distance_to(&p("202602A")), 3);
        let labels: Vec<String> = PeriodLabel::range(p("202511B"), 3)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(labels, vec!["202511B", "202512A", "202512B"]);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&p("202509A")).unwrap();
        assert_eq!(json, r#""202509A""#);
        let back: PeriodLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("202509A"));
        assert!(serde_json::from_str::<PeriodLabel>(r#""2025-09""#).is_err());
    }

    #[test]
    fn test_calendar_bounds() {
        let a = p("202402A");
        assert_eq!(a.start_date().to_string(), "2024-02-01");
        assert_eq!(a.end_date().to_string(), "2024-02-15");

        let b = p("202402B");
        assert_eq!(b.start_date().to_string(), "2024-02-16");
        assert_eq!(b.end_date().to_string(), "2024-02-29");

        assert_eq!(p("202512B").end_date().to_string(), "2025-12-31");
    }
}
