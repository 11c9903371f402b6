//! Calendar arithmetic for rollup buckets.
//!
//! All truncation happens in UTC. Timestamps are epoch seconds.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Aggregation granularity, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    Hour,
    Day,
    Month,
    Year,
}

/// Where a level pulls its inputs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationSource {
    /// Raw readings from the history table.
    Readings,
    /// Committed rollups of the given finer level.
    Rollups(Level),
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Hour, Level::Day, Level::Month, Level::Year];

    pub fn as_u8(self) -> u8 {
        match self {
            Level::Hour => 0,
            Level::Day => 1,
            Level::Month => 2,
            Level::Year => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Hour => "hour",
            Level::Day => "day",
            Level::Month => "month",
            Level::Year => "year",
        }
    }

    /// Next coarser level, `None` at the terminal level.
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Hour => Some(Level::Day),
            Level::Day => Some(Level::Month),
            Level::Month => Some(Level::Year),
            Level::Year => None,
        }
    }

    pub fn child(self) -> Option<Level> {
        match self {
            Level::Hour => None,
            Level::Day => Some(Level::Hour),
            Level::Month => Some(Level::Day),
            Level::Year => Some(Level::Month),
        }
    }

    pub fn source(self) -> AggregationSource {
        match self.child() {
            Some(child) => AggregationSource::Rollups(child),
            None => AggregationSource::Readings,
        }
    }

    /// Start of the bucket at this level that contains `ts`.
    pub fn truncate(self, ts: i64) -> i64 {
        match self {
            Level::Hour => start_of_hour(ts),
            Level::Day => start_of_day(ts),
            Level::Month => start_of_month(ts),
            Level::Year => start_of_year(ts),
        }
    }

    /// Key of the bucket a raw timestamp contributes to at this level.
    ///
    /// Hour buckets are keyed by the boundary that closes their window, so a
    /// reading at exactly 13:00:00 belongs to bucket 13:00 = (12:00, 13:00].
    pub fn bucket_for(self, ts: i64) -> i64 {
        match self {
            Level::Hour => hour_bucket_for(ts),
            other => other.truncate(ts),
        }
    }

    /// Parent level and the key of the parent bucket this bucket rolls up
    /// into. An hour key closes its window, so midnight belongs to the day
    /// that just ended.
    pub fn parent_bucket(self, bucket: i64) -> Option<(Level, i64)> {
        let parent = self.parent()?;
        let inside = match self {
            Level::Hour => bucket - 1,
            _ => bucket,
        };
        Some((parent, parent.truncate(inside)))
    }

    /// Child level and the half-open range of child keys that roll up into
    /// `bucket`. For a day `D` that is hour keys `(D, D + 24h]`.
    pub fn child_range(self, bucket: i64) -> Option<(Level, i64, i64)> {
        let child = self.child()?;
        let end = self.next_bucket_start(bucket);
        Some(match child {
            Level::Hour => (child, bucket + 1, end + 1),
            _ => (child, bucket, end),
        })
    }

    pub fn next_bucket_start(self, ts: i64) -> i64 {
        match self {
            Level::Hour => ts + HOUR,
            Level::Day => ts + DAY,
            Level::Month => add_months(ts, 1),
            Level::Year => add_months(ts, 12),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rollup level: {0}")]
pub struct UnknownLevel(pub String);

impl TryFrom<u8> for Level {
    type Error = UnknownLevel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Hour),
            1 => Ok(Level::Day),
            2 => Ok(Level::Month),
            3 => Ok(Level::Year),
            other => Err(UnknownLevel(other.to_string())),
        }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> Self {
        level.as_u8()
    }
}

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Level::Hour),
            "day" => Ok(Level::Day),
            "month" => Ok(Level::Month),
            "year" => Ok(Level::Year),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    // Out-of-range seconds saturate instead of panicking.
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(if ts < 0 { DateTime::<Utc>::MIN_UTC } else { DateTime::<Utc>::MAX_UTC })
}

fn midnight(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

pub fn start_of_hour(ts: i64) -> i64 {
    let dt = to_datetime(ts);
    ts - i64::from(dt.minute()) * 60 - i64::from(dt.second())
}

pub fn start_of_day(ts: i64) -> i64 {
    ts.div_euclid(DAY) * DAY
}

pub fn start_of_month(ts: i64) -> i64 {
    let date = to_datetime(ts).date_naive();
    date.with_day(1).map(midnight).unwrap_or_else(|| start_of_day(ts))
}

pub fn start_of_year(ts: i64) -> i64 {
    let date = to_datetime(ts).date_naive();
    NaiveDate::from_ymd_opt(date.year(), 1, 1)
        .map(midnight)
        .unwrap_or_else(|| start_of_day(ts))
}

/// Same instant `months` calendar months later; the day is clamped to the
/// length of the target month and the year rolls over past December.
fn add_months(ts: i64, months: u32) -> i64 {
    let dt = to_datetime(ts);
    dt.checked_add_months(Months::new(months))
        .map(|next| next.timestamp())
        .unwrap_or(ts)
}

/// Hour bucket a reading at `ts` belongs to: the hour boundary at or after it.
pub fn hour_bucket_for(ts: i64) -> i64 {
    start_of_hour(ts - 1) + HOUR
}

/// Reading window of an hour bucket as (exclusive start, inclusive end).
pub fn hour_window(bucket: i64) -> (i64, i64) {
    (bucket - HOUR, bucket)
}
