use crate::events::QueueEvent;
use crate::handler::JobOutcome;
use crate::runner::Shared;
use crate::schema::Job;
use crate::util::try_to_extract_panic_info;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// Result of one iteration of the drain loop.
enum Step {
    /// A job was dispatched and its outcome applied.
    Processed,
    /// There are no jobs left.
    Empty,
    /// The queue was stopped between fetching and dispatching.
    Interrupted,
}

pub(crate) struct Worker {
    pub(crate) shared: Arc<Shared>,
}

impl Worker {
    /// Dispatch jobs one at a time while the queue is running, waiting for new
    /// jobs whenever the table is empty.
    pub(crate) async fn run(&self) {
        debug!("Drain loop started");
        while self.shared.keep_draining() {
            match self.run_next_job().await {
                Ok(Step::Processed | Step::Interrupted) => {}
                Ok(Step::Empty) => {
                    if self.shared.announce_drained() {
                        debug!("Queue drained");
                    }
                    trace!("No pending jobs found. Waiting for new ones…");
                    self.shared.wake.notified().await;
                }
                Err(error) => {
                    error!("Failed to run job: {error:#}");
                    self.shared.halt();
                }
            }
        }
        debug!("Drain loop stopped");
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns an error only if the job table could not be read or updated.
    async fn run_next_job(&self) -> anyhow::Result<Step> {
        trace!("Looking for next job…");

        let Some(job) = self.shared.storage.fetch_job().await? else {
            return Ok(Step::Empty);
        };

        if !self.shared.begin_dispatch(&job.task) {
            debug!(job.id = job.id, "Queue stopped before the job was dispatched");
            return Ok(Step::Interrupted);
        }

        let span = info_span!("job", job.id = %job.id, job.task = %job.task);
        self.dispatch(job).instrument(span).await?;
        Ok(Step::Processed)
    }

    async fn dispatch(&self, job: Job) -> anyhow::Result<()> {
        debug!(job.attempts = job.attempts, "Running job…");

        let outcome = AssertUnwindSafe(self.shared.handler.process(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let error = try_to_extract_panic_info(&*panic);
                warn!("{error}");
                JobOutcome::Fail
            });

        match self.apply_outcome(job, outcome).await {
            Ok(event) => {
                self.shared
                    .finish_dispatch(Some(event), outcome == JobOutcome::CriticalFail);
                Ok(())
            }
            Err(error) => {
                self.shared.finish_dispatch(None, false);
                Err(error.into())
            }
        }
    }

    /// Update the job table according to `outcome` and build the event
    /// announcing it.
    async fn apply_outcome(
        &self,
        mut job: Job,
        outcome: JobOutcome,
    ) -> Result<QueueEvent, sqlx::Error> {
        let storage = &self.shared.storage;

        match outcome {
            JobOutcome::Success => {
                debug!("Deleting successful job…");
                storage.remove_job(job.id).await?;
                Ok(QueueEvent::JobSucceeded(job))
            }
            JobOutcome::Fail => {
                let retry_limit = self.shared.retry_limit.load(Ordering::Relaxed);
                match storage.increment_attempt_for_job(job.id).await? {
                    Some(attempts) => {
                        job.attempts = attempts;
                        if attempts >= retry_limit {
                            warn!(attempts, retry_limit, "Job failed and exhausted its retries");
                            storage.remove_job(job.id).await?;
                        } else {
                            warn!(attempts, retry_limit, "Job failed, it will be retried");
                        }
                    }
                    None => {
                        job.attempts = job.attempts.saturating_add(1);
                        debug!("Job failed but was already removed");
                    }
                }
                Ok(QueueEvent::JobFailed(job))
            }
            JobOutcome::CriticalFail => {
                error!("Job failed critically, discarding it and halting the queue");
                storage.remove_job(job.id).await?;
                Ok(QueueEvent::JobFailed(job))
            }
        }
    }
}
