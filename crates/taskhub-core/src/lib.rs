//! # TaskHub Core
//!
//! Types shared by the broker, the scheduler and the `taskhub` binary:
//! the queue-resident [`Task`], the [`DispatchError`] taxonomy, the TOML
//! configuration and the [`Clock`] used to drive schedules in tests.

pub mod clock;
pub mod config;
pub mod error;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BrokerConfig, SchedulerConfig, TaskHubConfig};
pub use error::{DispatchError, Result};
pub use task::{Params, Task, TaskSource};
