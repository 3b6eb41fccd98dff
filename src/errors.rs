use thiserror::Error;

/// Errors that can occur while adding a job to the queue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The job row could not be written.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Errors that can occur while opening the job database.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The schema migrations failed to apply.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Errors returned when parsing an [`Interval`](crate::Interval).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    /// No amount or unit was given.
    #[error("interval is empty")]
    Empty,

    /// The amount is not a non-negative integer.
    #[error("invalid interval amount `{0}`")]
    InvalidAmount(String),

    /// The unit is not one of seconds, minutes, hours, days, months or years.
    #[error("unknown interval unit `{0}`")]
    UnknownUnit(String),

    /// The interval starts with `+`, which would point into the future.
    #[error("interval `{0}` points into the future, jobs can only be pruned by age")]
    FutureOffset(String),
}
