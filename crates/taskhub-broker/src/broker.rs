//! Broker — task queue plus the shared public store behind one handle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use taskhub_core::config::BrokerConfig;
use taskhub_core::error::Result;
use taskhub_core::task::Task;

use crate::cleanup::CleanupLoop;
use crate::queue::TaskQueue;
use crate::timed_store::TimedStore;

/// In-memory message broker.
///
/// Queue and store each have their own lock, so pushes never wait on
/// store writes and vice versa.
pub struct Broker {
    queue: TaskQueue,
    store: Arc<TimedStore<Value>>,
    cleanup: CleanupLoop,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Self {
        tracing::info!("📬 Broker initialized");
        Self {
            queue: TaskQueue::new(),
            store: Arc::new(TimedStore::new()),
            cleanup: CleanupLoop::new(config.cleanup_interval()),
        }
    }

    // ─── Task queue ──────────────────────────────────────

    /// Push a task; returns its (possibly assigned) id.
    pub fn push_task(&self, task: Task) -> String {
        let task_type = task.task_type.clone();
        let task_id = self.queue.push(task);
        tracing::info!("📥 Task pushed: {} [{}]", task_id, task_type);
        task_id
    }

    /// Pop the head task, waiting up to `timeout` (`None` = forever).
    pub async fn pop_task(&self, timeout: Option<Duration>) -> Option<Task> {
        let task = self.queue.pop(timeout).await?;
        tracing::info!("📤 Task popped: {} [{}]", task.task_id, task.task_type);
        Some(task)
    }

    /// Pop without waiting.
    pub fn try_pop_task(&self) -> Option<Task> {
        self.queue.try_pop()
    }

    /// Consumer acknowledgment. Bookkeeping only; never triggers redelivery.
    pub fn task_done(&self) {
        self.queue.task_done();
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn unfinished_tasks(&self) -> usize {
        self.queue.unfinished()
    }

    // ─── Public store ──────────────────────────────────────

    pub fn set_public(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.store.set(key, value, ttl);
    }

    pub fn get_public(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    pub fn delete_public(&self, key: &str) -> bool {
        let deleted = self.store.delete(key);
        if deleted {
            tracing::debug!("Public data deleted: {}", key);
        }
        deleted
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn store_size(&self) -> usize {
        self.store.len()
    }

    pub fn clear_store(&self) -> usize {
        let count = self.store.clear();
        tracing::info!("Cleared {} public data entries", count);
        count
    }

    /// Manual sweep of expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.store.purge_expired();
        if removed > 0 {
            tracing::info!("🧹 Cleaned {} expired entries", removed);
        }
        removed
    }

    // ─── Background cleanup ──────────────────────────────────────

    pub fn start_cleanup(&self) -> Result<()> {
        self.cleanup.start(Arc::clone(&self.store))
    }

    pub fn stop_cleanup(&self) {
        self.cleanup.stop();
    }

    pub fn cleanup_running(&self) -> bool {
        self.cleanup.is_running()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}
