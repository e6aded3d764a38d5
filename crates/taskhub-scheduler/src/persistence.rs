//! SQLite-backed persistence for schedule definitions and the task ledger.
//! Survives restarts; the scheduler reloads its working set from here.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use taskhub_core::error::{DispatchError, Result};
use taskhub_core::task::Params;

use crate::rule::ScheduleKind;
use crate::schedule::{NewSchedule, ScheduleDefinition};
use crate::store::{ScheduleStore, TaskRecord, TaskStatus};

const SCHEDULE_COLUMNS: &str = "schedule_id, name, task_type, params, schedule_kind, \
     interval_seconds, cron_expression, execute_at, last_run_at, next_run_at, run_count, \
     max_runs, enabled, created_at, updated_at, description";

const RECORD_COLUMNS: &str = "task_id, task_type, params, status, priority, retry_count, \
     max_retries, created_at, started_at, completed_at, error_message, source_schedule_id";

/// SQLite-backed schedule store.
pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("open", e))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("💾 Scheduler database opened at {}", path.display());
        Ok(store)
    }

    /// A private database that lives as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open", e))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create tables and indexes. Safe to run on every open.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            -- Schedule definitions (interval, cron, once)
            CREATE TABLE IF NOT EXISTS schedule_definition (
                schedule_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',   -- JSON object
                schedule_kind TEXT NOT NULL,         -- 'interval', 'cron', 'once'
                interval_seconds INTEGER,
                cron_expression TEXT,
                execute_at TEXT,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                max_runs INTEGER NOT NULL DEFAULT 0, -- 0 = unbounded
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                description TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_schedule_due
                ON schedule_definition (enabled, next_run_at);

            -- Task ledger
            CREATE TABLE IF NOT EXISTS task_queue_record (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending', -- pending, processing, completed, failed
                priority INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                source_schedule_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_task_record_status
                ON task_queue_record (status, created_at);
         ",
            )
            .map_err(|e| db_err("migration", e))
    }

    fn write_record(conn: &Connection, record: &TaskRecord) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO task_queue_record ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.task_id,
                record.task_type,
                serde_json::to_string(&record.params)?,
                record.status.as_str(),
                record.priority,
                record.retry_count,
                record.max_retries,
                fmt_ts(record.created_at),
                record.started_at.map(fmt_ts),
                record.completed_at.map(fmt_ts),
                record.error_message,
                record.source_schedule_id,
            ],
        )
        .map_err(|e| db_err("save task record", e))?;
        Ok(())
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn save_schedule(&self, def: &ScheduleDefinition) -> Result<()> {
        let interval_seconds = def
            .interval_seconds()
            .map(i64::try_from)
            .transpose()
            .map_err(|_| DispatchError::invalid("interval_seconds does not fit in SQLite"))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO schedule_definition ({SCHEDULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    def.schedule_id,
                    def.name,
                    def.task_type,
                    serde_json::to_string(&def.params)?,
                    def.kind().as_str(),
                    interval_seconds,
                    def.cron_expression(),
                    def.execute_at().map(fmt_ts),
                    def.last_run_at.map(fmt_ts),
                    def.next_run_at.map(fmt_ts),
                    def.run_count,
                    def.max_runs,
                    def.enabled as i32,
                    fmt_ts(def.created_at),
                    fmt_ts(def.updated_at),
                    def.description,
                ],
            )
            .map_err(|e| db_err("save schedule", e))?;
        Ok(())
    }

    fn load_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedule_definition ORDER BY created_at, schedule_id"
            ))
            .map_err(|e| db_err("load schedules", e))?;
        let rows = stmt
            .query_map([], ScheduleRow::from_row)
            .map_err(|e| db_err("load schedules", e))?;

        let mut schedules = Vec::new();
        for row in rows {
            let row = row.map_err(|e| db_err("load schedules", e))?;
            let id = row.schedule_id.clone();
            match row.into_definition() {
                Ok(def) => schedules.push(def),
                Err(e) => tracing::warn!("⚠️ Skipping invalid schedule row {id}: {e}"),
            }
        }
        Ok(schedules)
    }

    fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedule_definition WHERE schedule_id = ?1"),
                [schedule_id],
                ScheduleRow::from_row,
            )
            .optional()
            .map_err(|e| db_err("get schedule", e))?;
        row.map(ScheduleRow::into_definition).transpose()
    }

    fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM schedule_definition WHERE schedule_id = ?1",
                [schedule_id],
            )
            .map_err(|e| db_err("delete schedule", e))?;
        Ok(deleted > 0)
    }

    fn record_task(&self, record: &TaskRecord) -> Result<()> {
        Self::write_record(&self.conn(), record)
    }

    fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM task_queue_record WHERE task_id = ?1"),
                [task_id],
                RecordRow::from_row,
            )
            .optional()
            .map_err(|e| db_err("get task record", e))?;

        let Some(row) = existing else {
            return Ok(false);
        };
        let mut record = row.into_record()?;
        record.transition(status, error, at);
        Self::write_record(&conn, &record)?;
        Ok(true)
    }

    fn list_task_records(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM task_queue_record
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at, task_id"
            ))
            .map_err(|e| db_err("list task records", e))?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], RecordRow::from_row)
            .map_err(|e| db_err("list task records", e))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|e| db_err("list task records", e))?;
            let id = row.task_id.clone();
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("⚠️ Skipping invalid task record {id}: {e}"),
            }
        }
        Ok(records)
    }

    fn prune_task_records(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM task_queue_record
                 WHERE status IN ('completed', 'failed')
                   AND completed_at IS NOT NULL AND completed_at < ?1",
                [fmt_ts(before)],
            )
            .map_err(|e| db_err("prune task records", e))?;
        Ok(removed)
    }
}

/// A `schedule_definition` row as stored, before validation.
struct ScheduleRow {
    schedule_id: String,
    name: String,
    task_type: String,
    params: String,
    schedule_kind: String,
    interval_seconds: Option<i64>,
    cron_expression: Option<String>,
    execute_at: Option<String>,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
    run_count: u32,
    max_runs: u32,
    enabled: bool,
    created_at: String,
    updated_at: String,
    description: Option<String>,
}

impl ScheduleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            schedule_id: row.get(0)?,
            name: row.get(1)?,
            task_type: row.get(2)?,
            params: row.get(3)?,
            schedule_kind: row.get(4)?,
            interval_seconds: row.get(5)?,
            cron_expression: row.get(6)?,
            execute_at: row.get(7)?,
            last_run_at: row.get(8)?,
            next_run_at: row.get(9)?,
            run_count: row.get(10)?,
            max_runs: row.get(11)?,
            enabled: row.get::<_, i32>(12)? != 0,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            description: row.get(15)?,
        })
    }

    /// Rebuild the definition, enforcing the one-rule-field invariant.
    fn into_definition(self) -> Result<ScheduleDefinition> {
        let interval_seconds = self
            .interval_seconds
            .map(u64::try_from)
            .transpose()
            .map_err(|_| DispatchError::invalid("negative interval_seconds"))?;

        let request = NewSchedule {
            name: self.name,
            task_type: self.task_type,
            kind: Some(self.schedule_kind.parse::<ScheduleKind>()?),
            params: parse_params(&self.params)?,
            interval_seconds,
            cron_expression: self.cron_expression,
            execute_at: parse_opt_ts(self.execute_at.as_deref())?,
            max_runs: self.max_runs,
            description: self.description,
        };
        let rule = request.validate()?;

        Ok(ScheduleDefinition {
            schedule_id: self.schedule_id,
            name: request.name,
            task_type: request.task_type,
            params: request.params,
            rule,
            last_run_at: parse_opt_ts(self.last_run_at.as_deref())?,
            next_run_at: parse_opt_ts(self.next_run_at.as_deref())?,
            run_count: self.run_count,
            max_runs: request.max_runs,
            enabled: self.enabled,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            description: request.description,
        })
    }
}

/// A `task_queue_record` row as stored.
struct RecordRow {
    task_id: String,
    task_type: String,
    params: String,
    status: String,
    priority: i32,
    retry_count: u32,
    max_retries: u32,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    source_schedule_id: Option<String>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            task_type: row.get(1)?,
            params: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            error_message: row.get(10)?,
            source_schedule_id: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord> {
        Ok(TaskRecord {
            task_id: self.task_id,
            task_type: self.task_type,
            params: parse_params(&self.params)?,
            status: self.status.parse()?,
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at.as_deref())?,
            completed_at: parse_opt_ts(self.completed_at.as_deref())?,
            error_message: self.error_message,
            source_schedule_id: self.source_schedule_id,
        })
    }
}

fn db_err(context: &str, e: rusqlite::Error) -> DispatchError {
    DispatchError::Database(format!("{context}: {e}"))
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DispatchError::Database(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn parse_params(raw: &str) -> Result<Params> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use taskhub_core::task::Task;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scheduler.db");
        let store = SqliteScheduleStore::open(&path).unwrap();
        assert!(store.load_schedules().unwrap().is_empty());
        drop(store);

        // Reopening runs the migration again.
        let store = SqliteScheduleStore::open(&path).unwrap();
        assert!(store.list_task_records(None).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_every_kind() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let mut params = Params::new();
        params.insert("temp_dir".into(), serde_json::json!("/tmp/music"));

        let interval = ScheduleDefinition::create(
            NewSchedule::interval("sync", "lidarr_sync", 300)
                .with_params(params)
                .with_max_runs(10)
                .with_description("pull new releases"),
            now(),
        )
        .unwrap();
        let cron = ScheduleDefinition::create(
            NewSchedule::cron("hourly", "cleanup_temp_files", "0 * * * *"),
            now() + Duration::seconds(1),
        )
        .unwrap();
        let once = ScheduleDefinition::create(
            NewSchedule::once("convert", "convert_audio", now() + Duration::hours(1)),
            now() + Duration::seconds(2),
        )
        .unwrap();

        for def in [&interval, &cron, &once] {
            store.save_schedule(def).unwrap();
        }

        let loaded = store.load_schedules().unwrap();
        assert_eq!(loaded, vec![interval.clone(), cron, once]);
        assert_eq!(
            store.get_schedule(&interval.schedule_id).unwrap(),
            Some(interval)
        );
        assert!(store.get_schedule("missing").unwrap().is_none());
    }

    #[test]
    fn test_sub_second_timestamps_survive() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let created = now() + Duration::microseconds(123_456);
        let def =
            ScheduleDefinition::create(NewSchedule::interval("x", "t", 1), created).unwrap();
        store.save_schedule(&def).unwrap();
        let loaded = store.get_schedule(&def.schedule_id).unwrap().unwrap();
        assert_eq!(loaded.created_at, created);
    }

    #[test]
    fn test_update_and_delete() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let mut def =
            ScheduleDefinition::create(NewSchedule::interval("x", "t", 60), now()).unwrap();
        store.save_schedule(&def).unwrap();

        def.record_run(now() + Duration::seconds(60)).unwrap();
        store.save_schedule(&def).unwrap();
        let loaded = store.load_schedules().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_count, 1);

        assert!(store.delete_schedule(&def.schedule_id).unwrap());
        assert!(!store.delete_schedule(&def.schedule_id).unwrap());
        assert!(store.load_schedules().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_rows_are_skipped() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let good =
            ScheduleDefinition::create(NewSchedule::interval("good", "t", 60), now()).unwrap();
        store.save_schedule(&good).unwrap();

        // Interval kind with both interval and cron columns set.
        store
            .conn()
            .execute(
                "INSERT INTO schedule_definition
                 (schedule_id, name, task_type, schedule_kind, interval_seconds, cron_expression,
                  created_at, updated_at)
                 VALUES ('bad', 'bad', 't', 'interval', 60, '* * * * *',
                         '2026-02-22T12:00:00Z', '2026-02-22T12:00:00Z')",
                [],
            )
            .unwrap();

        let loaded = store.load_schedules().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "good");
        assert!(store.get_schedule("bad").is_err());
    }

    #[test]
    fn test_task_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteScheduleStore::open(&dir.path().join("ledger.db")).unwrap();

        let task = Task::new("download_audio", Params::new()).with_source("s-1", "nightly");
        store.record_task(&TaskRecord::pending(&task)).unwrap();
        let other = Task::new("scan", Params::new());
        store.record_task(&TaskRecord::pending(&other)).unwrap();

        assert_eq!(store.list_task_records(None).unwrap().len(), 2);
        assert!(store
            .update_task_status(&task.task_id, TaskStatus::Processing, None, now())
            .unwrap());
        assert!(store
            .update_task_status(&task.task_id, TaskStatus::Failed, Some("network down"), now())
            .unwrap());
        assert!(!store
            .update_task_status("missing", TaskStatus::Completed, None, now())
            .unwrap());

        let failed = store.list_task_records(Some(TaskStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].started_at, Some(now()));
        assert_eq!(failed[0].error_message.as_deref(), Some("network down"));
        assert_eq!(failed[0].source_schedule_id.as_deref(), Some("s-1"));

        let pending = store.list_task_records(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, other.task_id);
    }

    #[test]
    fn test_prune_task_records() {
        let store = SqliteScheduleStore::open_in_memory().unwrap();
        let done = Task::new("scan", Params::new());
        let pending = Task::new("scan", Params::new());
        store.record_task(&TaskRecord::pending(&done)).unwrap();
        store.record_task(&TaskRecord::pending(&pending)).unwrap();
        store
            .update_task_status(&done.task_id, TaskStatus::Completed, None, now())
            .unwrap();

        assert_eq!(store.prune_task_records(now()).unwrap(), 0);
        assert_eq!(
            store.prune_task_records(now() + Duration::microseconds(1)).unwrap(),
            1
        );
        let left = store.list_task_records(None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].task_id, pending.task_id);
    }
}
