//! # TaskHub Scheduler
//!
//! Persistent schedules (interval, cron, once) that materialize tasks into
//! the [`taskhub_broker::Broker`] queue.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval, check every N secs)
//!   ├── working set   BTreeMap<id, ScheduleDefinition>
//!   ├── ScheduleStore SQLite (or memory), source of truth + task ledger
//!   └── Broker        receives one Task per firing
//! ```
//!
//! A due schedule's run is persisted before its task is pushed, so a crash
//! between the two loses the firing rather than duplicating it. Missed
//! periods collapse into a single firing.

pub mod cron;
pub mod engine;
pub mod global;
pub mod persistence;
pub mod rule;
pub mod schedule;
pub mod store;

pub use cron::CronSchedule;
pub use engine::{Scheduler, TickFailure, TickReport};
pub use global::{global_scheduler, shutdown_global_scheduler};
pub use persistence::SqliteScheduleStore;
pub use rule::{RunState, ScheduleKind, ScheduleRule, next_fire};
pub use schedule::{NewSchedule, ScheduleDefinition};
pub use store::{MemoryScheduleStore, ScheduleStore, TaskRecord, TaskStatus};
