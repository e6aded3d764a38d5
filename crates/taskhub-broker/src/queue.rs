//! FIFO task queue with waiting pops.
//!
//! The deque lock is held only for a single push/pop; waiting happens on a
//! [`Notify`] outside the lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use taskhub_core::task::{Task, new_task_id};
use tokio::sync::Notify;

/// Unbounded multi-producer, multi-consumer task queue.
pub struct TaskQueue {
    items: Mutex<VecDeque<Task>>,
    available: Notify,
    /// Pushed but not yet acknowledged with `task_done`.
    unfinished: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            unfinished: AtomicUsize::new(0),
        }
    }

    /// Append a task to the tail. Assigns an id when the task has none.
    pub fn push(&self, mut task: Task) -> String {
        if task.task_id.is_empty() {
            task.task_id = new_task_id();
        }
        let task_id = task.task_id.clone();
        let queued = {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.push_back(task);
            items.len()
        };
        self.unfinished.fetch_add(1, Ordering::AcqRel);
        self.available.notify_one();
        tracing::debug!("📥 Queue push: {} (queued: {})", task_id, queued);
        task_id
    }

    /// Remove the head without waiting.
    pub fn try_pop(&self) -> Option<Task> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Remove the head, waiting up to `timeout` for one to arrive.
    /// `None` waits indefinitely.
    pub async fn pop(&self, timeout: Option<Duration>) -> Option<Task> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_pop()).await.ok(),
            None => Some(self.wait_pop().await),
        }
    }

    async fn wait_pop(&self) -> Task {
        loop {
            // Register interest before checking so a push between the
            // check and the await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_pop() {
                // Pass the wakeup on if more work is waiting.
                if !self.is_empty() {
                    self.available.notify_one();
                }
                return task;
            }
            notified.await;
        }
    }

    /// Acknowledge a popped task.
    pub fn task_done(&self) {
        let _ = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Tasks pushed but not yet acknowledged.
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use taskhub_core::task::Params;

    fn make_task(id: &str) -> Task {
        Task::new("test", Params::new()).with_id(id)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new();
        queue.push(make_task("a"));
        queue.push(make_task("b"));
        queue.push(make_task("c"));

        let order: Vec<String> = [
            queue.pop(None).await.unwrap(),
            queue.pop(None).await.unwrap(),
            queue.pop(None).await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.task_id)
        .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_assigns_missing_id() {
        let queue = TaskQueue::new();
        let id = queue.push(Task::anonymous("scan", Params::new()));
        assert!(!id.is_empty());
        assert_eq!(queue.try_pop().unwrap().task_id, id);
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none() {
        let queue = TaskQueue::new();
        let started = std::time::Instant::now();
        assert!(queue.pop(Some(Duration::from_millis(50))).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(make_task("late"));

        let task = consumer.await.unwrap().unwrap();
        assert_eq!(task.task_id, "late");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_receive_disjoint_tasks() {
        let queue = Arc::new(TaskQueue::new());
        let total = 500;
        for i in 0..total {
            queue.push(make_task(&format!("t-{i}")));
        }

        let mut consumers = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(task) = queue.pop(Some(Duration::from_millis(50))).await {
                    seen.push(task.task_id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), total);
        assert_eq!(unique.len(), total);
    }

    #[tokio::test]
    async fn test_task_done_counter() {
        let queue = TaskQueue::new();
        queue.push(make_task("a"));
        queue.push(make_task("b"));
        assert_eq!(queue.unfinished(), 2);

        queue.try_pop();
        queue.task_done();
        assert_eq!(queue.unfinished(), 1);

        queue.task_done();
        queue.task_done();
        assert_eq!(queue.unfinished(), 0);
    }
}
