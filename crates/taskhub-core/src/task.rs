//! Task definitions — the unit of work carried by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque task parameters.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// A unit of work waiting for a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID. Empty means "assign one on push".
    #[serde(default)]
    pub task_id: String,
    /// Handler selector.
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub params: Params,
    pub enqueued_at: DateTime<Utc>,
    /// Set when the task was materialized by a schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TaskSource>,
}

/// The schedule a task came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    pub schedule_id: String,
    pub schedule_name: String,
}

impl Task {
    /// Create a task with a fresh id.
    pub fn new(task_type: impl Into<String>, params: Params) -> Self {
        Self {
            task_id: new_task_id(),
            task_type: task_type.into(),
            params,
            enqueued_at: Utc::now(),
            source: None,
        }
    }

    /// Create a task without an id; the queue assigns one on push.
    pub fn anonymous(task_type: impl Into<String>, params: Params) -> Self {
        Self {
            task_id: String::new(),
            ..Self::new(task_type, params)
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_source(mut self, schedule_id: &str, schedule_name: &str) -> Self {
        self.source = Some(TaskSource {
            schedule_id: schedule_id.to_string(),
            schedule_name: schedule_name.to_string(),
        });
        self
    }

    /// Id of the schedule that produced this task, if any.
    pub fn schedule_id(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.schedule_id.as_str())
    }
}

pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assigns_unique_ids() {
        let a = Task::new("scan", Params::new());
        let b = Task::new("scan", Params::new());
        assert_eq!(a.task_id.len(), 36);
        assert_ne!(a.task_id, b.task_id);
        assert!(Task::anonymous("scan", Params::new()).task_id.is_empty());
    }

    #[test]
    fn test_serializes_type_field() {
        let mut params = Params::new();
        params.insert("bv_id".into(), serde_json::json!("BV1xx411c7XZ"));
        let task = Task::new("download_audio", params)
            .with_id("t-1")
            .with_source("s-1", "nightly download");

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "download_audio");
        assert_eq!(json["params"]["bv_id"], "BV1xx411c7XZ");
        assert_eq!(json["source"]["schedule_id"], "s-1");
        assert_eq!(task.schedule_id(), Some("s-1"));
    }

    #[test]
    fn test_deserialize_without_optional_fields() {
        let task: Task = serde_json::from_str(
            r#"{"type":"cleanup","enqueued_at":"2026-02-22T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(task.task_id.is_empty());
        assert!(task.params.is_empty());
        assert!(task.source.is_none());
    }
}
