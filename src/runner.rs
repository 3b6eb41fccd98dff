use crate::cleaner::Cleaner;
use crate::errors::{EnqueueError, SetupError};
use crate::events::QueueEvent;
use crate::handler::JobHandler;
use crate::interval::Interval;
use crate::schema::Job;
use crate::storage::Storage;
use crate::worker::Worker;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

const DEFAULT_DATABASE_PATH: &str = "queue.sqlite";
const DEFAULT_RETRY_LIMIT: u32 = 4;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a [`Queue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Location of the SQLite database used by [`Queue::connect`].
    pub database_path: PathBuf,
    /// Number of failed attempts after which a job is abandoned.
    ///
    /// `0` abandons a job after its first failure.
    pub retry_limit: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Jobs older than this are pruned periodically. `None` disables pruning.
    pub retention: Option<Interval>,
    /// How often the retention pruning runs.
    pub cleanup_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            retry_limit: DEFAULT_RETRY_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            retention: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUE_DATABASE_PATH` | `queue.sqlite` | SQLite database file |
    /// | `QUEUE_RETRY_LIMIT` | `4` | Failed attempts before a job is abandoned |
    /// | `QUEUE_EVENT_CAPACITY` | `256` | Event channel capacity |
    /// | `QUEUE_RETENTION` | unset | Prune jobs older than this, e.g. `-7 days` |
    /// | `QUEUE_CLEANUP_INTERVAL_SECS` | `60` | Seconds between pruning runs |
    ///
    /// Values that fail to parse fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let database_path = lookup("QUEUE_DATABASE_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let retry_limit = lookup("QUEUE_RETRY_LIMIT")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.retry_limit);

        let event_capacity = lookup("QUEUE_EVENT_CAPACITY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&capacity| capacity > 0)
            .unwrap_or(defaults.event_capacity);

        let retention = lookup("QUEUE_RETENTION").and_then(|v| match v.parse::<Interval>() {
            Ok(interval) => Some(interval),
            Err(error) => {
                warn!(%error, value = %v, "Ignoring invalid QUEUE_RETENTION");
                None
            }
        });

        let cleanup_interval = lookup("QUEUE_CLEANUP_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.cleanup_interval);

        Self {
            database_path,
            retry_limit,
            event_capacity,
            retention,
            cleanup_interval,
        }
    }

    /// Set the database location.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the retry limit.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Periodically prune jobs older than `retention`, every `every`.
    pub fn with_retention(mut self, retention: Interval, every: Duration) -> Self {
        self.retention = Some(retention);
        self.cleanup_interval = every;
        self
    }
}

/// Run state of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// No jobs are dispatched.
    Stopped,
    /// Jobs are dispatched as long as there are any.
    Running,
    /// A stop was requested while a job was in flight. The queue becomes
    /// [`QueueState::Stopped`] once that job's outcome has been applied.
    Stopping,
}

pub(crate) struct Control {
    state: QueueState,
    active_task: Option<String>,
    drain_active: bool,
    drained_announced: bool,
    drain_task: Option<JoinHandle<()>>,
}

/// State shared between queue handles and the drain loop.
pub(crate) struct Shared {
    pub(crate) storage: Storage,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) retry_limit: AtomicU32,
    pub(crate) wake: Notify,
    events: broadcast::Sender<QueueEvent>,
    control: Mutex<Control>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: QueueEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn halt_locked(&self, control: &mut Control) {
        match control.state {
            QueueState::Running => {
                control.state = QueueState::Stopped;
                info!("Queue halted");
                self.publish(QueueEvent::QueueStopped);
            }
            QueueState::Stopping => control.state = QueueState::Stopped,
            QueueState::Stopped => {}
        }
    }

    /// Stop the queue from inside the drain loop.
    pub(crate) fn halt(&self) {
        let mut control = self.control();
        self.halt_locked(&mut control);
    }

    /// Checked by the drain loop before each iteration. Returning `false`
    /// also marks the loop as finished.
    pub(crate) fn keep_draining(&self) -> bool {
        let mut control = self.control();
        if control.state == QueueState::Running {
            return true;
        }
        control.state = QueueState::Stopped;
        control.drain_active = false;
        false
    }

    /// Mark a job as in flight, unless the queue was stopped after it was fetched.
    pub(crate) fn begin_dispatch(&self, task: &str) -> bool {
        let mut control = self.control();
        if control.state != QueueState::Running {
            return false;
        }
        control.active_task = Some(task.to_owned());
        control.drained_announced = false;
        true
    }

    /// Clear the in-flight job, then publish its outcome. A critical failure
    /// also halts the queue.
    pub(crate) fn finish_dispatch(&self, event: Option<QueueEvent>, halt: bool) {
        let mut control = self.control();
        control.active_task = None;
        if let Some(event) = event {
            self.publish(event);
        }
        if halt {
            self.halt_locked(&mut control);
        }
    }

    /// Publish [`QueueEvent::QueueDrained`] unless it was already published
    /// since the last dispatched job.
    pub(crate) fn announce_drained(&self) -> bool {
        let mut control = self.control();
        if control.state != QueueState::Running || control.drained_announced {
            return false;
        }
        control.drained_announced = true;
        self.publish(QueueEvent::QueueDrained);
        true
    }
}

/// Owned only by `Queue` handles, never by the drain loop, so it is dropped
/// together with the last handle.
struct HandleGuard {
    shared: Arc<Shared>,
    cleaner: Option<AbortHandle>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if let Some(cleaner) = &self.cleaner {
            cleaner.abort();
        }

        // Wake the drain loop so it sees the stopped state and lets go of `Shared`.
        let draining = {
            let mut control = self.shared.control();
            self.shared.halt_locked(&mut control);
            control.drain_active
        };
        if draining {
            debug!("Last queue handle dropped, stopping the drain loop");
            self.shared.wake.notify_one();
        }
    }
}

/// A durable, priority-ordered job queue drained by a single worker.
///
/// Jobs are persisted in [`Storage`] and dispatched one at a time to the
/// [`JobHandler`] chosen at construction: lowest `priority` first, oldest
/// first among equal priorities. Outcomes are reported as [`QueueEvent`]s.
///
/// `Queue` is a cheap handle; clones control the same queue.
///
/// A handler that never returns stalls the queue. There is no timeout on
/// job processing.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
    _guard: Arc<HandleGuard>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.shared.control();
        f.debug_struct("Queue")
            .field("state", &control.state)
            .field("active_task", &control.active_task)
            .field("retry_limit", &self.retry_limit())
            .finish()
    }
}

impl Queue {
    /// Create a stopped queue over `storage`.
    ///
    /// When `config.retention` is set, this spawns the pruning task and must
    /// be called from within a Tokio runtime.
    ///
    /// Dropping the last handle stops the queue like [`Queue::stop`] and ends
    /// the pruning task. The drain loop exits once an in-flight job is done.
    pub fn new(storage: Storage, handler: impl JobHandler, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let cleaner = Cleaner::new(storage.clone(), config.retention, config.cleanup_interval)
            .map(Cleaner::start);

        let shared = Shared {
            storage,
            handler: Arc::new(handler),
            retry_limit: AtomicU32::new(config.retry_limit),
            wake: Notify::new(),
            events,
            control: Mutex::new(Control {
                state: QueueState::Stopped,
                active_task: None,
                drain_active: false,
                drained_announced: false,
                drain_task: None,
            }),
        };

        let shared = Arc::new(shared);
        let guard = HandleGuard {
            shared: shared.clone(),
            cleaner,
        };

        Self {
            shared,
            _guard: Arc::new(guard),
        }
    }

    /// Open the database at `config.database_path` and create a stopped queue over it.
    pub async fn connect(
        config: QueueConfig,
        handler: impl JobHandler,
    ) -> Result<Self, SetupError> {
        let storage = Storage::open(&config.database_path).await?;
        Ok(Self::new(storage, handler, config))
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// The storage this queue drains.
    pub fn storage(&self) -> &Storage {
        &self.shared.storage
    }

    /// Current run state.
    pub fn state(&self) -> QueueState {
        self.shared.control().state
    }

    /// Whether the queue is dispatching jobs.
    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    /// Number of failed attempts after which a job is abandoned.
    pub fn retry_limit(&self) -> u32 {
        self.shared.retry_limit.load(Ordering::Relaxed)
    }

    /// Change the retry limit. Applies to failures from now on.
    pub fn set_retry_limit(&self, retry_limit: u32) {
        self.shared.retry_limit.store(retry_limit, Ordering::Relaxed);
    }

    /// Start dispatching jobs.
    ///
    /// Does nothing if the queue is already running. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut control = self.shared.control();
        if control.state == QueueState::Running {
            return;
        }

        control.state = QueueState::Running;
        control.drained_announced = false;
        info!("Starting queue…");
        self.shared.publish(QueueEvent::QueueStarted);

        if control.drain_active {
            // The previous loop has not exited yet and picks up from here.
            drop(control);
            self.shared.wake.notify_one();
            return;
        }

        control.drain_active = true;
        let worker = Worker {
            shared: self.shared.clone(),
        };
        let span = info_span!("drain");
        control.drain_task = Some(tokio::spawn(async move { worker.run().instrument(span).await }));
    }

    /// Stop dispatching jobs.
    ///
    /// A job that is already being processed runs to completion and its
    /// outcome is applied; the queue is [`QueueState::Stopping`] until then.
    /// Does nothing if the queue is not running.
    pub fn stop(&self) {
        let mut control = self.shared.control();
        if control.state != QueueState::Running {
            return;
        }

        control.state = if control.active_task.is_some() {
            QueueState::Stopping
        } else {
            QueueState::Stopped
        };
        info!(state = ?control.state, "Stopping queue…");
        self.shared.publish(QueueEvent::QueueStopped);
        drop(control);

        self.shared.wake.notify_one();
    }

    /// Stop the queue and wait until the drain loop has exited.
    pub async fn shutdown(&self) {
        self.stop();
        let drain_task = self.shared.control().drain_task.take();
        if let Some(handle) = drain_task {
            if let Err(error) = handle.await {
                warn!(%error, "Drain loop panicked");
            }
        }
    }

    /// Add a job with priority 0 (the highest).
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        data: &T,
        task: &str,
    ) -> Result<i64, EnqueueError> {
        self.enqueue_with_priority(data, task, 0).await
    }

    /// Add a job. Lower `priority` values are processed first.
    ///
    /// Returns the id of the new job.
    #[instrument(name = "queue.enqueue", skip(self, data))]
    pub async fn enqueue_with_priority<T: Serialize + ?Sized>(
        &self,
        data: &T,
        task: &str,
        priority: u32,
    ) -> Result<i64, EnqueueError> {
        let data = serde_json::to_value(data)?;
        let id = self.shared.storage.create_job(&data, task, priority).await?;
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Remove every job. A job that is already being processed still runs
    /// to completion.
    #[instrument(name = "queue.empty", skip(self))]
    pub async fn empty(&self) -> Result<u64, sqlx::Error> {
        let removed = self.shared.storage.remove_all_jobs().await?;
        info!(removed, "Emptied queue");
        Ok(removed)
    }

    /// Remove all jobs created longer than `interval` ago.
    pub async fn remove_old_jobs(&self, interval: &Interval) -> Result<u64, sqlx::Error> {
        self.shared.storage.remove_old_jobs(interval).await
    }

    /// Whether a job with this task label is persisted.
    pub async fn job_exists_for_task(&self, task: &str) -> Result<bool, sqlx::Error> {
        self.shared.storage.job_exists_for_task(task).await
    }

    /// Whether the job currently being processed has this task label.
    pub fn job_is_active_for_task(&self, task: &str) -> bool {
        self.shared.control().active_task.as_deref() == Some(task)
    }

    /// The job with this task label that would be dispatched next.
    pub async fn next_job_for_task(&self, task: &str) -> Result<Option<Job>, sqlx::Error> {
        self.shared.storage.fetch_job_for_task(task).await
    }

    /// Number of persisted jobs.
    pub async fn job_count(&self) -> Result<i64, sqlx::Error> {
        self.shared.storage.fetch_job_count().await
    }
}
