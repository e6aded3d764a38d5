//! Scheduler engine — turns due schedules into queue tasks.
//! Uses tokio::interval for ticking; each tick runs on the blocking pool
//! because the store is synchronous.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use taskhub_broker::Broker;
use taskhub_core::clock::{Clock, SystemClock};
use taskhub_core::config::SchedulerConfig;
use taskhub_core::error::{DispatchError, Result};
use taskhub_core::task::Params;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::persistence::SqliteScheduleStore;
use crate::rule::{self, ScheduleKind};
use crate::schedule::{NewSchedule, ScheduleDefinition};
use crate::store::{ScheduleStore, TaskRecord, TaskStatus};

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ids of the tasks pushed this tick, in schedule id order.
    pub dispatched: Vec<String>,
    pub failures: Vec<TickFailure>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.failures.is_empty()
    }
}

/// A due schedule that could not be dispatched this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFailure {
    pub schedule_id: String,
    pub error: String,
    /// Whether the next tick can be expected to succeed.
    pub transient: bool,
}

/// The scheduler: owns the working set of schedules and the tick loop.
///
/// The store is the source of truth. Other processes (the CLI) may write to
/// it while the scheduler runs, so every tick refreshes the working set from
/// the store and re-checks each due row before claiming it.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Ledger task ids this instance has already re-queued.
    recovered: Mutex<HashSet<String>>,
}

struct SchedulerCore {
    store: Arc<dyn ScheduleStore>,
    broker: Arc<Broker>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Schedules by id; ticks walk them in id order.
    working: Mutex<BTreeMap<String, ScheduleDefinition>>,
    /// Serializes tick, register, pause, resume, delete and reload.
    writes: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler over `store`, pushing into `broker`.
    /// The working set starts empty; call [`Scheduler::reload`] or
    /// [`Scheduler::start`] to pick up stored schedules.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        broker: Arc<Broker>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_clock(store, broker, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ScheduleStore>,
        broker: Arc<Broker>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                store,
                broker,
                clock,
                config,
                working: Mutex::new(BTreeMap::new()),
                writes: Mutex::new(()),
            }),
            worker: Mutex::new(None),
            recovered: Mutex::new(HashSet::new()),
        }
    }

    /// Open the SQLite store at `config.db_path` and load its schedules.
    pub fn open(config: &SchedulerConfig, broker: Arc<Broker>) -> Result<Self> {
        let store = SqliteScheduleStore::open(&config.resolved_db_path())?;
        let scheduler = Self::new(Arc::new(store), broker, config.clone());
        scheduler.reload()?;
        Ok(scheduler)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.core.broker
    }

    // ─── Registration ──────────────────────────────────────

    /// Validate, persist and activate a new schedule. Returns its id.
    pub fn register(&self, request: NewSchedule) -> Result<String> {
        let now = self.core.clock.now();
        let def = ScheduleDefinition::create(request, now)?;
        let _writes = self.core.lock_writes();

        self.core.store.save_schedule(&def)?;
        tracing::info!(
            "📅 Schedule added: '{}' ({}) {}, next run {}",
            def.name,
            def.schedule_id,
            def.rule,
            fmt_next(def.next_run_at)
        );
        let id = def.schedule_id.clone();
        self.core.lock_working().insert(id.clone(), def);
        Ok(id)
    }

    /// Flat-argument form of [`Scheduler::register`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_schedule(
        &self,
        name: &str,
        task_type: &str,
        kind: ScheduleKind,
        params: Params,
        interval_seconds: Option<u64>,
        cron_expression: Option<&str>,
        execute_at: Option<DateTime<Utc>>,
        max_runs: u32,
        description: Option<&str>,
    ) -> Result<String> {
        self.register(NewSchedule {
            name: name.to_string(),
            task_type: task_type.to_string(),
            kind: Some(kind),
            params,
            interval_seconds,
            cron_expression: cron_expression.map(str::to_string),
            execute_at,
            max_runs,
            description: description.map(str::to_string),
        })
    }

    // ─── Management ──────────────────────────────────────

    /// Stop a schedule from firing. Tasks already pushed stay queued.
    pub fn pause(&self, schedule_id: &str) -> Result<bool> {
        let _writes = self.core.lock_writes();
        let Some(mut def) = self.core.store.get_schedule(schedule_id)? else {
            return Ok(false);
        };

        def.enabled = false;
        def.updated_at = self.core.clock.now();
        self.core.store.save_schedule(&def)?;
        tracing::info!("⏸️ Schedule paused: '{}' ({})", def.name, def.schedule_id);
        self.core.lock_working().insert(def.schedule_id.clone(), def);
        Ok(true)
    }

    /// Re-enable a schedule. Counting restarts from now, so time spent
    /// paused is not caught up.
    pub fn resume(&self, schedule_id: &str) -> Result<bool> {
        let _writes = self.core.lock_writes();
        let Some(mut def) = self.core.store.get_schedule(schedule_id)? else {
            return Ok(false);
        };
        if def.is_exhausted() {
            return Err(DispatchError::invalid(format!(
                "schedule '{}' has used its {} run(s) and cannot be resumed",
                def.name,
                def.run_count
            )));
        }

        let now = self.core.clock.now();
        def.enabled = true;
        def.next_run_at = rule::rebase(&def.rule, &def.run_state(), now)?;
        if def.next_run_at.is_none() {
            return Err(DispatchError::invalid(format!(
                "schedule '{}' has no future fire time",
                def.name
            )));
        }
        def.updated_at = now;

        self.core.store.save_schedule(&def)?;
        tracing::info!(
            "▶️ Schedule resumed: '{}' ({}), next run {}",
            def.name,
            def.schedule_id,
            fmt_next(def.next_run_at)
        );
        self.core.lock_working().insert(def.schedule_id.clone(), def);
        Ok(true)
    }

    /// Remove a schedule for good.
    pub fn delete(&self, schedule_id: &str) -> Result<bool> {
        let _writes = self.core.lock_writes();
        let deleted = self.core.store.delete_schedule(schedule_id)?;
        let cached = self.core.lock_working().remove(schedule_id).is_some();
        if deleted || cached {
            tracing::info!("🗑️ Schedule deleted: {}", schedule_id);
        }
        Ok(deleted || cached)
    }

    /// All schedules from the store, oldest first.
    pub fn list(&self, enabled_only: bool) -> Result<Vec<ScheduleDefinition>> {
        let mut all = self.core.store.load_schedules()?;
        if enabled_only {
            all.retain(|def| def.enabled);
        }
        Ok(all)
    }

    pub fn get(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        self.core.store.get_schedule(schedule_id)
    }

    pub fn pause_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.pause(schedule_id)
    }

    pub fn resume_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.resume(schedule_id)
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        self.delete(schedule_id)
    }

    pub fn list_schedules(&self, enabled_only: bool) -> Result<Vec<ScheduleDefinition>> {
        self.list(enabled_only)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        self.get(schedule_id)
    }

    /// Replace the working set with what the store holds. Returns how many
    /// schedules were loaded.
    pub fn reload(&self) -> Result<usize> {
        self.core.reload()
    }

    // ─── Ticking ──────────────────────────────────────

    /// Fire everything due at the clock's current time.
    pub fn tick(&self) -> TickReport {
        self.core.tick_at(self.core.clock.now())
    }

    /// Fire everything due at `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        self.core.tick_at(now)
    }

    /// Reload from the store and spawn the tick loop on the current tokio
    /// runtime. No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::warn!("Scheduler already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::Runtime(format!("scheduler needs a tokio runtime: {e}")))?;

        let loaded = self.core.reload()?;
        if let Err(e) = self.prune_task_records() {
            tracing::warn!("⚠️ Ledger pruning failed: {e}");
        }
        if self.core.config.recover_pending_tasks {
            let recovered = self.recover_pending_tasks()?;
            if recovered > 0 {
                tracing::info!("♻️ Re-queued {} pending task(s) from the ledger", recovered);
            }
        }

        let core = Arc::clone(&self.core);
        let period = self.core.config.check_interval();
        *worker = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let core = Arc::clone(&core);
                let tick = tokio::task::spawn_blocking(move || core.tick_at(core.clock.now()));
                match tick.await {
                    Ok(report) if !report.is_empty() => tracing::debug!(
                        "Tick: {} dispatched, {} failed",
                        report.dispatched.len(),
                        report.failures.len()
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("❌ Scheduler tick aborted: {e}"),
                }
            }
        }));

        tracing::info!(
            "⏰ Scheduler started with {} schedule(s) (check every {:?})",
            loaded,
            period
        );
        Ok(())
    }

    /// Abort the tick loop. A tick already on the blocking pool finishes.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
            tracing::info!("⏰ Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ─── Task ledger ──────────────────────────────────────

    /// A consumer picked the task up.
    pub fn mark_task_started(&self, task_id: &str) -> Result<bool> {
        self.core.store.update_task_status(
            task_id,
            TaskStatus::Processing,
            None,
            self.core.clock.now(),
        )
    }

    /// A consumer finished the task. `Err` carries the handler's message.
    pub fn mark_task_finished(
        &self,
        task_id: &str,
        outcome: std::result::Result<(), String>,
    ) -> Result<bool> {
        let now = self.core.clock.now();
        match outcome {
            Ok(()) => self
                .core
                .store
                .update_task_status(task_id, TaskStatus::Completed, None, now),
            Err(message) => {
                tracing::warn!("⚠️ Task {} failed: {}", task_id, message);
                self.core.store.update_task_status(
                    task_id,
                    TaskStatus::Failed,
                    Some(&message),
                    now,
                )
            }
        }
    }

    pub fn task_records(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>> {
        self.core.store.list_task_records(status)
    }

    /// Push `pending` ledger records back into the broker. Meant for
    /// process start, when the in-memory queue is empty. Each record is
    /// re-queued at most once per scheduler instance. Returns how many were
    /// pushed.
    pub fn recover_pending_tasks(&self) -> Result<usize> {
        let pending = self.core.store.list_task_records(Some(TaskStatus::Pending))?;
        let working = self.core.lock_working().clone();
        let mut recovered = self.recovered.lock().unwrap_or_else(|e| e.into_inner());
        let mut pushed = 0;
        for record in &pending {
            if !recovered.insert(record.task_id.clone()) {
                continue;
            }
            let mut task = record.to_task();
            if let (Some(source), Some(def)) = (
                task.source.as_mut(),
                record.source_schedule_id.as_ref().and_then(|id| working.get(id)),
            ) {
                source.schedule_name = def.name.clone();
            }
            self.core.broker.push_task(task);
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Delete completed and failed ledger records older than
    /// `scheduler.record_retention_days`. Returns how many were removed.
    pub fn prune_task_records(&self) -> Result<usize> {
        let Some(retention) = self.core.config.record_retention() else {
            return Ok(0);
        };
        let removed = self
            .core
            .store
            .prune_task_records(self.core.clock.now() - retention)?;
        if removed > 0 {
            tracing::info!("🧹 Pruned {} finished task record(s)", removed);
        }
        Ok(removed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerCore {
    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_working(&self) -> MutexGuard<'_, BTreeMap<String, ScheduleDefinition>> {
        self.working.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reload(&self) -> Result<usize> {
        let _writes = self.lock_writes();
        self.refresh(self.clock.now())
    }

    /// Replace the working set from the store. Callers hold the write lock.
    fn refresh(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fresh = BTreeMap::new();

        for mut def in self.store.load_schedules()? {
            if def.enabled && def.next_run_at.is_none() {
                if let Err(e) = def.ensure_next_run(now) {
                    tracing::warn!("⚠️ Schedule '{}' has no computable next run: {e}", def.name);
                    continue;
                }
                def.updated_at = now;
                if let Err(e) = self.store.save_schedule(&def) {
                    tracing::warn!("⚠️ Failed to save next run for '{}': {e}", def.name);
                }
            }
            fresh.insert(def.schedule_id.clone(), def);
        }

        let count = fresh.len();
        *self.lock_working() = fresh;
        tracing::debug!("Working set reloaded: {} schedule(s)", count);
        Ok(count)
    }

    fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let _writes = self.lock_writes();
        let mut report = TickReport::default();

        if let Err(e) = self.refresh(now) {
            tracing::warn!("⚠️ Could not refresh schedules, using cached copies: {e}");
        }

        let due: Vec<ScheduleDefinition> = self
            .lock_working()
            .values()
            .filter(|def| def.is_due(now))
            .cloned()
            .collect();

        for def in due {
            // Another process may have paused, deleted or edited the row
            // since the refresh.
            match self.store.get_schedule(&def.schedule_id) {
                Ok(Some(current)) if current.enabled && current.updated_at <= def.updated_at => {}
                Ok(current) => {
                    tracing::debug!("Schedule {} changed in the store, skipping", def.schedule_id);
                    let mut working = self.lock_working();
                    match current {
                        Some(current) => working.insert(def.schedule_id.clone(), current),
                        None => working.remove(&def.schedule_id),
                    };
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Could not re-read schedule {}: {e}", def.schedule_id);
                    report.failures.push(TickFailure {
                        schedule_id: def.schedule_id,
                        transient: e.is_transient(),
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            let mut updated = def.clone();
            if let Err(e) = updated.record_run(now) {
                self.back_off(def, now, &e);
                report.failures.push(TickFailure {
                    schedule_id: updated.schedule_id,
                    transient: false,
                    error: e.to_string(),
                });
                continue;
            }

            // Persist first: a task is only pushed once its run is on record.
            if let Err(e) = self.store.save_schedule(&updated) {
                let transient = e.is_transient();
                if transient {
                    tracing::warn!(
                        "⚠️ Failed to persist run of '{}' ({}), retrying next tick: {e}",
                        def.name,
                        def.schedule_id
                    );
                } else {
                    tracing::error!(
                        "❌ Failed to persist run of '{}' ({}): {e}",
                        def.name,
                        def.schedule_id
                    );
                }
                report.failures.push(TickFailure {
                    schedule_id: def.schedule_id,
                    transient,
                    error: e.to_string(),
                });
                continue;
            }

            let task = def.materialize(now);
            let task_id = self.broker.push_task(task.clone());
            if let Err(e) = self.store.record_task(&TaskRecord::pending(&task)) {
                tracing::warn!("⚠️ Failed to record task {} in ledger: {e}", task_id);
            }
            tracing::info!(
                "🔔 Schedule triggered: '{}' → task {} (run {})",
                updated.name,
                task_id,
                updated.run_count
            );
            if !updated.enabled {
                tracing::info!("🏁 Schedule '{}' finished after {} run(s)", updated.name, updated.run_count);
            }

            self.lock_working().insert(updated.schedule_id.clone(), updated);
            report.dispatched.push(task_id);
        }

        report
    }

    /// Push a schedule whose next fire time can't be computed out by the
    /// error backoff so it isn't retried every tick.
    fn back_off(&self, mut def: ScheduleDefinition, now: DateTime<Utc>, cause: &DispatchError) {
        let retry_at = now + self.config.error_backoff();
        tracing::error!(
            "❌ Schedule '{}' ({}) failed to evaluate: {cause}; retrying at {}",
            def.name,
            def.schedule_id,
            retry_at.to_rfc3339()
        );
        def.next_run_at = Some(retry_at);
        def.updated_at = now;
        if let Err(e) = self.store.save_schedule(&def) {
            tracing::warn!("⚠️ Failed to persist backoff for '{}': {e}", def.name);
        }
        self.lock_working().insert(def.schedule_id.clone(), def);
    }
}

fn fmt_next(next: Option<DateTime<Utc>>) -> String {
    next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
}
