//! Calendar types for billing periods
//!
//! - `DateRange`: an inclusive range of calendar days, used for billing
//!   periods and the service window of a charge
//! - `Timezone`: the operator's business timezone, used to decide which
//!   calendar day "today" is for due-date and overdue checks

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

/// Timezone wrapper for the billing operator's jurisdiction
///
/// Wraps chrono_tz::Tz with custom serialization support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezone(pub Tz);

impl Serialize for Timezone {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.name())
    }
}

impl<'de> Deserialize<'de> for Timezone {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for Timezone {
    type Err = TemporalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tz::from_str(s)
            .map(Timezone)
            .map_err(|_| TemporalError::InvalidTimezone(s.to_string()))
    }
}

impl Timezone {
    pub fn new(tz: Tz) -> Self {
        Self(tz)
    }

    /// Returns the local calendar date of a UTC instant
    pub fn local_date(&self, utc: DateTime<Utc>) -> NaiveDate {
        utc.with_timezone(&self.0).date_naive()
    }

    /// Returns the local calendar date right now
    pub fn today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self(chrono_tz::UTC)
    }
}

/// Errors related to temporal operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemporalError {
    #[error("Invalid period: start {start} must not be after end {end}")]
    InvalidPeriod {
        start: String,
        end: String,
    },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Date out of range")]
    OutOfRange,
}

/// An inclusive range of calendar days
///
/// Both `start` and `end` are part of the range, so a range from the 1st to
/// the 30th of a month has 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, TemporalError> {
        if start > end {
            return Err(TemporalError::InvalidPeriod {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// The calendar month containing `date`
    pub fn month_of(date: NaiveDate) -> Result<Self, TemporalError> {
        let start = date.with_day(1).ok_or(TemporalError::OutOfRange)?;
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .ok_or(TemporalError::OutOfRange)?;
        Self::new(start, end)
    }

    /// The calendar month before the one containing `date`
    pub fn previous_month_of(date: NaiveDate) -> Result<Self, TemporalError> {
        let first = date.with_day(1).ok_or(TemporalError::OutOfRange)?;
        let prev = first.pred_opt().ok_or(TemporalError::OutOfRange)?;
        Self::month_of(prev)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Number of days in the range, counting both ends
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Returns the days shared by both ranges, if any
    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.intersection(other).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_days_are_inclusive() {
        let range = DateRange::new(date(2024, 6, 1), date(2024, 6, 30)).unwrap();
        assert_eq!(range.days(), 30);

        let single = DateRange::new(date(2024, 6, 1), date(2024, 6, 1)).unwrap();
        assert_eq!(single.days(), 1);
    }

    #[test]
    fn test_month_of_handles_leap_february() {
        let feb = DateRange::month_of(date(2024, 2, 14)).unwrap();
        assert_eq!(feb.start, date(2024, 2, 1));
        assert_eq!(feb.end, date(2024, 2, 29));
    }

    #[test]
    fn test_previous_month_rolls_over_year() {
        let dec = DateRange::previous_month_of(date(2025, 1, 5)).unwrap();
        assert_eq!(dec.start, date(2024, 12, 1));
        assert_eq!(dec.end, date(2024, 12, 31));
    }

    #[test]
    fn test_intersection() {
        let period = DateRange::new(date(2024, 6, 1), date(2024, 6, 30)).unwrap();
        let service = DateRange::new(date(2024, 6, 16), date(2024, 7, 15)).unwrap();

        let overlap = period.intersection(&service).unwrap();
        assert_eq!(overlap.days(), 15);

        let later = DateRange::new(date(2024, 7, 1), date(2024, 7, 2)).unwrap();
        assert!(period.intersection(&later).is_none());
    }
}
