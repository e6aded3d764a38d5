//! Schedule definitions — the durable data model for scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::error::{DispatchError, Result};
use taskhub_core::task::{Params, Task, new_task_id};

use crate::cron::CronSchedule;
use crate::rule::{self, RunState, ScheduleKind, ScheduleRule};

/// A registered schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub schedule_id: String,
    pub name: String,
    /// Type of the tasks this schedule produces.
    pub task_type: String,
    #[serde(default)]
    pub params: Params,
    pub rule: ScheduleRule,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    /// 0 = unbounded.
    pub max_runs: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
}

impl ScheduleDefinition {
    /// Build a definition from a validated request, with its first fire time.
    pub fn create(request: NewSchedule, now: DateTime<Utc>) -> Result<Self> {
        let rule = request.validate()?;
        let state = RunState::new(now, request.max_runs);
        let next_run_at = rule::next_fire(&rule, &state, now)?.ok_or_else(|| {
            DispatchError::invalid(format!("{rule} never fires"))
        })?;

        Ok(Self {
            schedule_id: new_task_id(),
            name: request.name,
            task_type: request.task_type,
            params: request.params,
            rule,
            last_run_at: None,
            next_run_at: Some(next_run_at),
            run_count: 0,
            max_runs: request.max_runs,
            enabled: true,
            created_at: now,
            updated_at: now,
            description: request.description,
        })
    }

    pub fn kind(&self) -> ScheduleKind {
        self.rule.kind()
    }

    pub fn interval_seconds(&self) -> Option<u64> {
        match &self.rule {
            ScheduleRule::Interval { every_secs } => Some(*every_secs),
            _ => None,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match &self.rule {
            ScheduleRule::Cron { expression } => Some(expression.expression()),
            _ => None,
        }
    }

    pub fn execute_at(&self) -> Option<DateTime<Utc>> {
        match &self.rule {
            ScheduleRule::Once { at } => Some(*at),
            _ => None,
        }
    }

    pub fn run_state(&self) -> RunState {
        RunState {
            created_at: self.created_at,
            last_run_at: self.last_run_at,
            run_count: self.run_count,
            max_runs: self.max_runs,
            enabled: self.enabled,
        }
    }

    /// Whether the run budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.run_state().exhausted()
            || (self.kind() == ScheduleKind::Once && self.run_count > 0)
    }

    /// Check if this schedule should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_exhausted() && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// The queue task for one firing.
    pub fn materialize(&self, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(&self.task_type, self.params.clone())
            .with_source(&self.schedule_id, &self.name);
        task.enqueued_at = now;
        task
    }

    /// Account for one firing at `now`: bump counters, compute the next fire
    /// time, and disable the schedule when it will not fire again.
    pub fn record_run(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.run_count += 1;
        self.last_run_at = Some(now);
        self.updated_at = now;
        self.next_run_at = rule::next_fire(&self.rule, &self.run_state(), now)?;
        if self.next_run_at.is_none() {
            self.enabled = false;
        }
        Ok(())
    }

    /// Fill in `next_run_at` for an enabled schedule that lacks one
    /// (rows written by older versions or edited by hand).
    pub fn ensure_next_run(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.enabled && self.next_run_at.is_none() {
            self.next_run_at = rule::next_fire(&self.rule, &self.run_state(), now)?;
            if self.next_run_at.is_none() {
                self.enabled = false;
            }
        }
        Ok(())
    }
}

/// A registration request in the flat form callers and the CLI speak:
/// a kind tag plus the matching rule field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub task_type: String,
    pub kind: Option<ScheduleKind>,
    #[serde(default)]
    pub params: Params,
    pub interval_seconds: Option<u64>,
    pub cron_expression: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_runs: u32,
    pub description: Option<String>,
}

impl NewSchedule {
    /// Run every `every_secs` seconds.
    pub fn interval(name: &str, task_type: &str, every_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            kind: Some(ScheduleKind::Interval),
            interval_seconds: Some(every_secs),
            ..Default::default()
        }
    }

    /// Run on a cron expression.
    pub fn cron(name: &str, task_type: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            kind: Some(ScheduleKind::Cron),
            cron_expression: Some(expression.to_string()),
            ..Default::default()
        }
    }

    /// Run once at `at`.
    pub fn once(name: &str, task_type: &str, at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            kind: Some(ScheduleKind::Once),
            execute_at: Some(at),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = max_runs;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Check the request and turn it into a rule. Exactly one of
    /// `interval_seconds`, `cron_expression`, `execute_at` must be set, and
    /// it must agree with `kind` when a kind is given.
    pub fn validate(&self) -> Result<ScheduleRule> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::invalid("name must not be empty"));
        }
        if self.task_type.trim().is_empty() {
            return Err(DispatchError::invalid("task_type must not be empty"));
        }

        let rule = match (&self.interval_seconds, &self.cron_expression, &self.execute_at) {
            (Some(0), None, None) => {
                return Err(DispatchError::invalid("interval_seconds must be > 0"));
            }
            (Some(every_secs), None, None) => ScheduleRule::Interval {
                every_secs: *every_secs,
            },
            (None, Some(expression), None) => ScheduleRule::Cron {
                expression: CronSchedule::parse(expression)?,
            },
            (None, None, Some(at)) => ScheduleRule::Once { at: *at },
            (None, None, None) => {
                return Err(DispatchError::invalid(
                    "one of interval_seconds, cron_expression or execute_at is required",
                ));
            }
            _ => {
                return Err(DispatchError::invalid(
                    "only one of interval_seconds, cron_expression or execute_at may be set",
                ));
            }
        };

        if let Some(kind) = self.kind
            && kind != rule.kind()
        {
            return Err(DispatchError::invalid(format!(
                "schedule kind '{kind}' does not match the {} rule given",
                rule.kind()
            )));
        }
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 12, 7, 0).unwrap()
    }

    #[test]
    fn test_create_interval() {
        let def = ScheduleDefinition::create(
            NewSchedule::interval("sync", "lidarr_sync", 30).with_max_runs(5),
            now(),
        )
        .unwrap();
        assert_eq!(def.kind(), ScheduleKind::Interval);
        assert_eq!(def.interval_seconds(), Some(30));
        assert_eq!(def.next_run_at, Some(now() + Duration::seconds(30)));
        assert_eq!(def.max_runs, 5);
        assert!(def.enabled);
        assert!(!def.is_due(now()));
        assert!(def.is_due(now() + Duration::seconds(30)));
    }

    #[test]
    fn test_create_cron_and_once() {
        let cron = ScheduleDefinition::create(
            NewSchedule::cron("hourly", "cleanup_temp_files", "0 * * * *"),
            now(),
        )
        .unwrap();
        assert_eq!(cron.cron_expression(), Some("0 * * * *"));
        assert_eq!(
            cron.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 22, 13, 0, 0).unwrap())
        );

        let at = now() + Duration::seconds(5);
        let once =
            ScheduleDefinition::create(NewSchedule::once("convert", "convert_audio", at), now())
                .unwrap();
        assert_eq!(once.execute_at(), Some(at));
        assert_eq!(once.next_run_at, Some(at));
    }

    #[test]
    fn test_validation_errors() {
        let mut both = NewSchedule::interval("x", "t", 10);
        both.cron_expression = Some("* * * * *".into());
        assert!(both.validate().is_err());

        let none = NewSchedule {
            name: "x".into(),
            task_type: "t".into(),
            ..Default::default()
        };
        assert!(none.validate().is_err());

        assert!(NewSchedule::interval("x", "t", 0).validate().is_err());
        assert!(NewSchedule::interval("", "t", 10).validate().is_err());
        assert!(NewSchedule::interval("x", " ", 10).validate().is_err());
        assert!(NewSchedule::cron("x", "t", "61 * * * *").validate().is_err());

        let mut mismatched = NewSchedule::interval("x", "t", 10);
        mismatched.kind = Some(ScheduleKind::Cron);
        assert!(mismatched.validate().is_err());

        let mut untagged = NewSchedule::interval("x", "t", 10);
        untagged.kind = None;
        assert!(untagged.validate().is_ok());
    }

    #[test]
    fn test_cron_that_never_fires_is_rejected() {
        let err = ScheduleDefinition::create(NewSchedule::cron("x", "t", "0 0 30 2 *"), now())
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSchedule(_)));
    }

    #[test]
    fn test_record_run_until_exhausted() {
        let mut def = ScheduleDefinition::create(
            NewSchedule::interval("x", "t", 1).with_max_runs(2),
            now(),
        )
        .unwrap();

        let first = now() + Duration::seconds(1);
        def.record_run(first).unwrap();
        assert_eq!(def.run_count, 1);
        assert_eq!(def.last_run_at, Some(first));
        assert_eq!(def.next_run_at, Some(first + Duration::seconds(1)));
        assert!(def.enabled);

        def.record_run(first + Duration::seconds(1)).unwrap();
        assert_eq!(def.run_count, 2);
        assert_eq!(def.next_run_at, None);
        assert!(!def.enabled);
        assert!(def.is_exhausted());
    }

    #[test]
    fn test_record_run_once_disables() {
        let mut def =
            ScheduleDefinition::create(NewSchedule::once("x", "t", now()), now()).unwrap();
        assert!(def.is_due(now()));
        def.record_run(now()).unwrap();
        assert!(!def.enabled);
        assert!(def.is_exhausted());
        assert!(!def.is_due(now() + Duration::days(1)));
    }

    #[test]
    fn test_materialize() {
        let mut params = Params::new();
        params.insert("temp_dir".into(), serde_json::json!("/tmp/music"));
        let def = ScheduleDefinition::create(
            NewSchedule::interval("cleanup", "cleanup_temp_files", 300).with_params(params),
            now(),
        )
        .unwrap();

        let task = def.materialize(now());
        assert_eq!(task.task_type, "cleanup_temp_files");
        assert_eq!(task.params["temp_dir"], "/tmp/music");
        assert_eq!(task.schedule_id(), Some(def.schedule_id.as_str()));
        assert_ne!(task.task_id, def.schedule_id);
    }

    #[test]
    fn test_ensure_next_run() {
        let mut def =
            ScheduleDefinition::create(NewSchedule::interval("x", "t", 60), now()).unwrap();
        def.next_run_at = None;
        def.ensure_next_run(now() + Duration::hours(1)).unwrap();
        assert_eq!(def.next_run_at, Some(now() + Duration::hours(1)));
    }
}
