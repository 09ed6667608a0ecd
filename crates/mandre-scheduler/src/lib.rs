//! Durable task scheduler for MandreLib plugins.
//!
//! This crate provides a persistent scheduler that:
//! - Stores task state through a pluggable [`TaskStore`]
//! - Survives crashes and restarts (in-flight deliveries count as a failed attempt)
//! - Supports one-shot, fixed-interval and calendar (cron) tasks
//! - Retries failed deliveries with capped exponential backoff
//!
//! Time comes only from a [`Clock`] and due work leaves only through a
//! [`DispatchSink`], so hosts and tests inject both.

pub mod calendar;
mod clock;
mod config;
mod dispatch;
mod driver;
mod error;
mod events;
mod scheduler;
pub mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use dispatch::{DeliveryFn, DeliveryOutcome, DispatchSink, FnSink, LogSink};
pub use error::SchedulerError;
pub use events::{SchedulerEvent, TaskOutcome, TickReport};
pub use scheduler::Scheduler;
pub use store::{FileStore, MemoryStore, TaskStore};
pub use types::{RetryPolicy, Settlement, Task, TaskHandle, TaskId, TaskKind, TaskSpec, TaskState};
