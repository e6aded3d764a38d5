//! Schedule storage — the durable source of truth behind the scheduler.
//!
//! [`ScheduleStore`] is implemented by the SQLite store in
//! [`crate::persistence`] and by [`MemoryScheduleStore`] for embedding and tests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::error::{DispatchError, Result};
use taskhub_core::task::{Params, Task};

use crate::schedule::ScheduleDefinition;

/// Default retry budget recorded on new ledger entries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle of a dispatched task as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DispatchError::Other(format!("unknown task status '{other}'"))),
        }
    }
}

/// One row of the task ledger: an audit trail of what was dispatched and
/// what consumers reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub params: Params,
    pub status: TaskStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub source_schedule_id: Option<String>,
}

impl TaskRecord {
    /// Finished (completed or failed) before `before`.
    pub fn finished_before(&self, before: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
            && self.completed_at.is_some_and(|at| at < before)
    }

    /// A fresh `pending` record for a task that was just pushed.
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            params: task.params.clone(),
            status: TaskStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: task.enqueued_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            source_schedule_id: task.schedule_id().map(str::to_string),
        }
    }

    /// Rebuild the queue task this record describes.
    pub fn to_task(&self) -> Task {
        let mut task = Task::new(&self.task_type, self.params.clone()).with_id(&self.task_id);
        task.enqueued_at = self.created_at;
        if let Some(schedule_id) = &self.source_schedule_id {
            task = task.with_source(schedule_id, "");
        }
        task
    }

    /// Apply a status transition at `at`.
    pub fn transition(&mut self, status: TaskStatus, error: Option<&str>, at: DateTime<Utc>) {
        match status {
            TaskStatus::Pending => {}
            TaskStatus::Processing => self.started_at = Some(at),
            TaskStatus::Completed => {
                self.completed_at = Some(at);
                self.error_message = None;
            }
            TaskStatus::Failed => {
                self.completed_at = Some(at);
                self.retry_count += 1;
                self.error_message = error.map(str::to_string);
            }
        }
        self.status = status;
    }
}

/// Durable storage for schedule definitions and the task ledger.
///
/// Unknown ids are reported as `Ok(false)` / `Ok(None)`, not errors.
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace a definition.
    fn save_schedule(&self, def: &ScheduleDefinition) -> Result<()>;

    /// All definitions, ordered by `created_at` then id.
    fn load_schedules(&self) -> Result<Vec<ScheduleDefinition>>;

    fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>>;

    fn delete_schedule(&self, schedule_id: &str) -> Result<bool>;

    /// Insert or replace a ledger record.
    fn record_task(&self, record: &TaskRecord) -> Result<()>;

    /// Move a ledger record to `status`. Returns false for unknown ids.
    fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Ledger records, optionally filtered by status, oldest first.
    fn list_task_records(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>>;

    /// Delete completed and failed records that finished before `before`.
    /// Pending and processing records are kept. Returns how many were removed.
    fn prune_task_records(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// In-memory store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<String, ScheduleDefinition>>,
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn save_schedule(&self, def: &ScheduleDefinition) -> Result<()> {
        let mut schedules = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        schedules.insert(def.schedule_id.clone(), def.clone());
        Ok(())
    }

    fn load_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let schedules = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ScheduleDefinition> = schedules.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.schedule_id.cmp(&b.schedule_id))
        });
        Ok(all)
    }

    fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        let schedules = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.get(schedule_id).cloned())
    }

    fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let mut schedules = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(schedules.remove(schedule_id).is_some())
    }

    fn record_task(&self, record: &TaskRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(task_id) {
            Some(record) => {
                record.transition(status, error, at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_task_records(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<TaskRecord> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(out)
    }

    fn prune_task_records(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let len = records.len();
        records.retain(|_, r| !r.finished_before(before));
        Ok(len - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::NewSchedule;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_memory_store_schedules() {
        let store = MemoryScheduleStore::new();
        let first =
            ScheduleDefinition::create(NewSchedule::interval("a", "t", 60), now()).unwrap();
        let second = ScheduleDefinition::create(
            NewSchedule::interval("b", "t", 60),
            now() + Duration::seconds(1),
        )
        .unwrap();
        store.save_schedule(&second).unwrap();
        store.save_schedule(&first).unwrap();

        let all = store.load_schedules().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a");
        assert_eq!(store.get_schedule(&first.schedule_id).unwrap(), Some(first.clone()));

        assert!(store.delete_schedule(&first.schedule_id).unwrap());
        assert!(!store.delete_schedule(&first.schedule_id).unwrap());
        assert!(store.get_schedule(&first.schedule_id).unwrap().is_none());
    }

    #[test]
    fn test_ledger_transitions() {
        let store = MemoryScheduleStore::new();
        let task = Task::new("download_audio", Params::new()).with_source("s-1", "nightly");
        store.record_task(&TaskRecord::pending(&task)).unwrap();

        let pending = store.list_task_records(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_schedule_id.as_deref(), Some("s-1"));
        assert_eq!(pending[0].max_retries, DEFAULT_MAX_RETRIES);

        assert!(store
            .update_task_status(&task.task_id, TaskStatus::Processing, None, now())
            .unwrap());
        assert!(store
            .update_task_status(&task.task_id, TaskStatus::Failed, Some("timeout"), now())
            .unwrap());
        assert!(!store
            .update_task_status("missing", TaskStatus::Completed, None, now())
            .unwrap());

        let failed = store.list_task_records(Some(TaskStatus::Failed)).unwrap();
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(failed[0].started_at, Some(now()));
        assert!(store.list_task_records(Some(TaskStatus::Pending)).unwrap().is_empty());
        assert_eq!(store.list_task_records(None).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_unfinished_and_recent() {
        let store = MemoryScheduleStore::new();
        let old_done = Task::new("a", Params::new());
        let old_failed = Task::new("b", Params::new());
        let recent_done = Task::new("c", Params::new());
        let still_pending = Task::new("d", Params::new());
        for task in [&old_done, &old_failed, &recent_done, &still_pending] {
            store.record_task(&TaskRecord::pending(task)).unwrap();
        }
        let old = now() - Duration::days(30);
        store
            .update_task_status(&old_done.task_id, TaskStatus::Completed, None, old)
            .unwrap();
        store
            .update_task_status(&old_failed.task_id, TaskStatus::Failed, Some("x"), old)
            .unwrap();
        store
            .update_task_status(&recent_done.task_id, TaskStatus::Completed, None, now())
            .unwrap();

        assert_eq!(store.prune_task_records(now() - Duration::days(7)).unwrap(), 2);
        let left: Vec<String> = store
            .list_task_records(None)
            .unwrap()
            .into_iter()
            .map(|r| r.task_id)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&recent_done.task_id));
        assert!(left.contains(&still_pending.task_id));
    }

    #[test]
    fn test_record_to_task() {
        let mut params = Params::new();
        params.insert("bv_id".into(), serde_json::json!("BV1"));
        let task = Task::new("download_audio", params).with_source("s-9", "x");
        let rebuilt = TaskRecord::pending(&task).to_task();
        assert_eq!(rebuilt.task_id, task.task_id);
        assert_eq!(rebuilt.params, task.params);
        assert_eq!(rebuilt.schedule_id(), Some("s-9"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
    }
}
