//! Schedule rules and the next-fire evaluator.
//!
//! Everything here is pure: callers pass "now" in, nothing reads the clock.
//!
//! Missed occurrences are collapsed: a periodic schedule that is overdue
//! fires once, immediately, and then counts forward from the firing time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::error::{DispatchError, Result};

use crate::cron::CronSchedule;

/// When/how a schedule triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleRule {
    /// Run every N seconds.
    Interval { every_secs: u64 },
    /// Run on a cron schedule.
    Cron { expression: CronSchedule },
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
}

impl ScheduleRule {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Self::Interval { .. } => ScheduleKind::Interval,
            Self::Cron { .. } => ScheduleKind::Cron,
            Self::Once { .. } => ScheduleKind::Once,
        }
    }
}

impl fmt::Display for ScheduleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Self::Cron { expression } => write!(f, "cron '{expression}'"),
            Self::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

/// The schedule kind tag as stored in the `schedule_kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Cron,
    Once,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
            Self::Once => "once",
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            "once" => Ok(Self::Once),
            other => Err(DispatchError::invalid(format!(
                "unknown schedule kind '{other}' (expected interval, cron or once)"
            ))),
        }
    }
}

/// The mutable run bookkeeping the evaluator looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunState {
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    /// 0 = unbounded.
    pub max_runs: u32,
    pub enabled: bool,
}

impl RunState {
    /// Fresh state for a schedule created at `created_at`.
    pub fn new(created_at: DateTime<Utc>, max_runs: u32) -> Self {
        Self {
            created_at,
            last_run_at: None,
            run_count: 0,
            max_runs,
            enabled: true,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.max_runs > 0 && self.run_count >= self.max_runs
    }
}

/// Next fire time for `rule` given its run state, or `None` when it will
/// never fire again.
///
/// - interval: `(last_run_at | created_at) + every`, or `now` when overdue.
/// - cron: first match at or after `max(now, last_run_at + 1s)`.
/// - once: `at` until it has run.
pub fn next_fire(
    rule: &ScheduleRule,
    state: &RunState,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if !state.enabled || state.exhausted() {
        return Ok(None);
    }

    match rule {
        ScheduleRule::Interval { every_secs } => {
            let base = state.last_run_at.unwrap_or(state.created_at);
            let next = add_secs(base, *every_secs)?;
            Ok(Some(if next <= now { now } else { next }))
        }
        ScheduleRule::Cron { expression } => {
            let start = match state.last_run_at {
                Some(last) => now.max(last + Duration::seconds(1)),
                None => now,
            };
            Ok(expression.next_from(start))
        }
        ScheduleRule::Once { at } => Ok((state.run_count == 0).then_some(*at)),
    }
}

/// Next fire time when counting restarts at `now` (used on resume, so a
/// paused schedule does not fire for the time it was paused).
pub fn rebase(
    rule: &ScheduleRule,
    state: &RunState,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if !state.enabled || state.exhausted() {
        return Ok(None);
    }

    match rule {
        ScheduleRule::Interval { every_secs } => add_secs(now, *every_secs).map(Some),
        ScheduleRule::Cron { expression } => {
            Ok(expression.next_from(now + Duration::seconds(1)))
        }
        ScheduleRule::Once { .. } => next_fire(rule, state, now),
    }
}

fn add_secs(base: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| base.checked_add_signed(d))
        .ok_or_else(|| DispatchError::invalid(format!("interval of {secs}s overflows the calendar")))
}
