#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod errors;
mod events;
mod handler;
mod interval;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// Error types for setup, enqueueing and interval parsing.
pub use self::errors::{EnqueueError, IntervalError, SetupError};
/// Notifications published by the queue.
pub use self::events::QueueEvent;
/// The capability that processes jobs, and adapters for closures.
pub use self::handler::{
    Completion, CompletionHandler, FnHandler, JobHandler, JobOutcome, completion_handler,
    handler_fn,
};
/// Relative intervals for age-based pruning.
pub use self::interval::{Interval, IntervalUnit};
/// The queue controller and its configuration.
pub use self::runner::{Queue, QueueConfig, QueueState};
/// A persisted job.
pub use self::schema::Job;
/// The durable job table.
pub use self::storage::{Storage, setup_database};

/// Re-exported for implementing [`JobHandler`].
pub use async_trait::async_trait;
