use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::interval::Interval;
use crate::storage::Storage;

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Periodically prunes jobs older than the configured retention.
pub(crate) struct Cleaner {
    storage: Storage,
    retention: Interval,
    period: Duration,
}

impl Cleaner {
    /// No cleaner is needed if no retention is configured.
    pub(crate) fn new(
        storage: Storage,
        retention: Option<Interval>,
        period: Duration,
    ) -> Option<Self> {
        Some(Self {
            storage,
            retention: retention?,
            period: period.max(MIN_PERIOD),
        })
    }

    pub(crate) fn start(self) -> AbortHandle {
        let span = info_span!("cleaner", retention = %self.retention);
        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.period);
                loop {
                    ticker.tick().await;
                    match self.storage.remove_old_jobs(&self.retention).await {
                        Ok(0) => debug!("No expired jobs to remove"),
                        Ok(removed) => info!(removed, "Removed expired jobs"),
                        Err(error) => warn!(%error, "Failed to remove expired jobs"),
                    }
                }
            }
            .instrument(span),
        );
        task.abort_handle()
    }
}
