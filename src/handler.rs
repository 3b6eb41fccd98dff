//! The capability the queue invokes to process each job.

use crate::schema::Job;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::warn;

/// Result of processing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOutcome {
    /// The job is done and gets removed from the queue.
    Success,
    /// The job failed and is retried until the retry limit is reached.
    Fail,
    /// The job failed in a way that retrying cannot fix.
    ///
    /// The job is discarded and the queue stops.
    CriticalFail,
}

/// Trait for the application logic that processes jobs.
///
/// The queue never calls [`JobHandler::process`] concurrently: the next job
/// is only dispatched once the previous outcome has been applied.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process one job and report how it went.
    async fn process(&self, job: &Job) -> JobOutcome;
}

/// Handler built from a synchronous closure. See [`handler_fn`].
#[derive(Debug, Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a synchronous closure as a [`JobHandler`].
///
/// ```
/// use durable_queue::{JobOutcome, handler_fn};
///
/// let handler = handler_fn(|job| {
///     println!("processing {}", job.task);
///     JobOutcome::Success
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Job) -> JobOutcome + Send + Sync + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> JobOutcome + Send + Sync + 'static,
{
    async fn process(&self, job: &Job) -> JobOutcome {
        (self.f)(job)
    }
}

/// One-shot callback a [`completion_handler`] uses to report its outcome.
///
/// `complete` consumes the completion, so an outcome is reported at most once.
/// Dropping it without calling `complete` counts as [`JobOutcome::Fail`].
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<JobOutcome>,
}

impl Completion {
    /// Report the outcome of the job.
    pub fn complete(self, outcome: JobOutcome) {
        // The queue only stops listening if it has been dropped entirely.
        let _ = self.tx.send(outcome);
    }
}

/// Handler built from a callback-style closure. See [`completion_handler`].
#[derive(Debug, Clone)]
pub struct CompletionHandler<F> {
    f: F,
}

/// Wrap a closure that reports its outcome through a [`Completion`].
///
/// The closure may hand the completion to another task; the queue waits
/// until it is completed or dropped.
///
/// ```
/// use durable_queue::{JobOutcome, completion_handler};
///
/// let handler = completion_handler(|job, completion| {
///     tokio::spawn(async move {
///         println!("uploading {}", job.id);
///         completion.complete(JobOutcome::Success);
///     });
/// });
/// # let _ = handler;
/// ```
pub fn completion_handler<F>(f: F) -> CompletionHandler<F>
where
    F: Fn(Job, Completion) + Send + Sync + 'static,
{
    CompletionHandler { f }
}

#[async_trait]
impl<F> JobHandler for CompletionHandler<F>
where
    F: Fn(Job, Completion) + Send + Sync + 'static,
{
    async fn process(&self, job: &Job) -> JobOutcome {
        let (tx, rx) = oneshot::channel();
        (self.f)(job.clone(), Completion { tx });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(job.id = job.id, "Completion was dropped without an outcome");
                JobOutcome::Fail
            }
        }
    }
}
