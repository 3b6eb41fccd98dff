use crate::schema::Job;

/// Lifecycle and outcome notifications published by a [`Queue`](crate::Queue).
///
/// Events are delivered through a broadcast channel obtained from
/// [`Queue::subscribe`](crate::Queue::subscribe). Slow subscribers may observe
/// [`RecvError::Lagged`](tokio::sync::broadcast::error::RecvError::Lagged);
/// the queue never waits for them.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The queue moved to the running state.
    QueueStarted,
    /// The queue was asked to stop, or halted after a critical failure.
    QueueStopped,
    /// A job was processed successfully and removed.
    JobSucceeded(Job),
    /// A job failed. After an ordinary failure `attempts` already counts it;
    /// a critical failure leaves the stored count untouched.
    JobFailed(Job),
    /// No jobs are left to process.
    QueueDrained,
}
