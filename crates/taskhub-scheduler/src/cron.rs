//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Field forms: `*`, `N`, `*/N`, `a,b,c`
//! Example: "0 8 * * *" = every day at 8:00
//!
//! All five fields must match (no POSIX day-of-month/day-of-week OR rule).
//! `*/N` matches values divisible by N, i.e. every Nth unit counted from 0.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::error::{DispatchError, Result};

/// How far ahead a search runs before giving up. Four years, so that
/// leap-day expressions still resolve.
pub const CRON_SEARCH_HORIZON_DAYS: i64 = 4 * 366;

/// One parsed cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    Any,
    Exact(u32),
    Every(u32),
    List(Vec<u32>),
}

impl CronField {
    fn parse(spec: &str, name: &str, min: u32, max: u32) -> Result<Self> {
        if spec == "*" {
            return Ok(Self::Any);
        }

        // */N — every N
        if let Some(step) = spec.strip_prefix("*/") {
            let n: u32 = step
                .parse()
                .map_err(|_| DispatchError::invalid(format!("{name}: bad step '{spec}'")))?;
            if n == 0 || n > max {
                return Err(DispatchError::invalid(format!(
                    "{name}: step must be within 1..={max}, got {n}"
                )));
            }
            return Ok(Self::Every(n));
        }

        // Comma-separated: "0,15,30,45"
        if spec.contains(',') {
            let values = spec
                .split(',')
                .map(|part| parse_value(part.trim(), name, min, max))
                .collect::<Result<Vec<u32>>>()?;
            return Ok(Self::List(values));
        }

        parse_value(spec, name, min, max).map(Self::Exact)
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(n) => *n == value,
            Self::Every(step) => value % step == 0,
            Self::List(values) => values.contains(&value),
        }
    }

    /// Map day-of-week 7 onto 0 (both mean Sunday).
    fn normalize_sunday(self) -> Self {
        match self {
            Self::Exact(7) => Self::Exact(0),
            Self::List(values) => {
                Self::List(values.into_iter().map(|v| if v == 7 { 0 } else { v }).collect())
            }
            other => other,
        }
    }
}

fn parse_value(raw: &str, name: &str, min: u32, max: u32) -> Result<u32> {
    let n: u32 = raw
        .parse()
        .map_err(|_| DispatchError::invalid(format!("{name}: '{raw}' is not a number")))?;
    if n < min || n > max {
        return Err(DispatchError::invalid(format!(
            "{name}: {n} is outside {min}..={max}"
        )));
    }
    Ok(n)
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expression: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(DispatchError::invalid(format!(
                "cron expression '{expression}' needs 5 fields: MIN HOUR DOM MON DOW"
            )));
        }

        Ok(Self {
            expression: parts.join(" "),
            minute: CronField::parse(parts[0], "minute", 0, 59)?,
            hour: CronField::parse(parts[1], "hour", 0, 23)?,
            day_of_month: CronField::parse(parts[2], "day-of-month", 1, 31)?,
            month: CronField::parse(parts[3], "month", 1, 12)?,
            day_of_week: CronField::parse(parts[4], "day-of-week", 0, 7)?.normalize_sunday(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether `at` (truncated to the minute) matches every field.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.matches_day(at) && self.hour.matches(at.hour()) && self.minute.matches(at.minute())
    }

    fn matches_day(&self, at: DateTime<Utc>) -> bool {
        self.month.matches(at.month())
            && self.day_of_month.matches(at.day())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }

    /// First matching minute at or after `start` (rounded up to a whole minute).
    /// `None` when nothing matches within [`CRON_SEARCH_HORIZON_DAYS`].
    pub fn next_from(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = start + Duration::days(CRON_SEARCH_HORIZON_DAYS);
        let mut candidate = ceil_to_minute(start)?;

        while candidate <= limit {
            if !self.matches_day(candidate) {
                // Skip to the next midnight.
                candidate = candidate
                    .date_naive()
                    .succ_opt()?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !self.hour.matches(candidate.hour()) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minute.matches(candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }

        None
    }

    /// The next `count` fire times strictly after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after + Duration::seconds(1);
        while times.len() < count {
            match self.next_from(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next + Duration::seconds(1);
                }
                None => break,
            }
        }
        times
    }
}

fn ceil_to_minute(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = at.with_second(0)?.with_nanosecond(0)?;
    if floor == at {
        Some(floor)
    } else {
        Some(floor + Duration::minutes(1))
    }
}

impl FromStr for CronSchedule {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = DispatchError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CronSchedule> for String {
    fn from(schedule: CronSchedule) -> Self {
        schedule.expression
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
