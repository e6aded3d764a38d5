//! # TaskHub Broker
//!
//! In-memory task queue plus a shared key-value store with TTL.
//!
//! ## Architecture
//! ```text
//! Broker
//!   ├── TaskQueue   FIFO, unbounded, waiting pop with timeout
//!   ├── TimedStore  key → (value, expiry), expired keys read as absent
//!   └── CleanupLoop tokio interval that purges expired keys
//! ```
//!
//! Producers push directly or through the scheduler; consumers call
//! [`Broker::pop_task`] from as many tasks as they like. Each task is
//! delivered to at most one consumer.

pub mod broker;
pub mod cleanup;
pub mod global;
pub mod queue;
pub mod timed_store;

pub use broker::Broker;
pub use cleanup::CleanupLoop;
pub use global::{global_broker, init_global_broker};
pub use queue::TaskQueue;
pub use timed_store::TimedStore;
