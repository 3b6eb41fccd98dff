use crate::errors::SetupError;
use crate::interval::Interval;
use crate::schema::Job;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

/// Apply the job table migrations to the given pool.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), SetupError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Durable job table backed by SQLite.
///
/// Every method is a single statement, so each one is atomic on its own.
/// Mutations addressed to a job that no longer exists are silently ignored.
/// Cloning is cheap and shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if necessary) the job database at `path`.
    #[instrument(name = "storage.open", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        setup_database(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a job table that lives only as long as this storage.
    ///
    /// The pool keeps exactly one connection alive forever, since an
    /// in-memory SQLite database disappears with its last connection.
    pub async fn in_memory() -> Result<Self, SetupError> {
        let options = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        setup_database(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool. The caller is responsible for running
    /// [`setup_database`] on it.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new job with zero attempts, returning its id.
    pub async fn create_job(
        &self,
        data: &Value,
        task: &str,
        priority: u32,
    ) -> Result<i64, sqlx::Error> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (task, data, priority, attempts, stamp) VALUES (?, ?, ?, 0, ?) RETURNING id",
        )
        .bind(task)
        .bind(Json(data))
        .bind(priority)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        debug!(job.id = id, job.task = task, job.priority = priority, "Created job");
        Ok(id)
    }

    /// Whether at least one job with this task label is persisted.
    pub async fn job_exists_for_task(&self, task: &str) -> Result<bool, sqlx::Error> {
        let exists =
            sqlx::query_scalar::<_, i64>("SELECT EXISTS (SELECT 1 FROM jobs WHERE task = ?)")
                .bind(task)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists != 0)
    }

    /// Marks that we just tried and failed to run a job.
    ///
    /// Returns the new attempt count, or `None` if the job has been removed
    /// in the meantime.
    pub async fn increment_attempt_for_job(&self, job_id: i64) -> Result<Option<u32>, sqlx::Error> {
        sqlx::query_scalar::<_, u32>(
            "UPDATE jobs SET attempts = attempts + 1 WHERE id = ? RETURNING attempts",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete every job created longer than `interval` ago.
    ///
    /// Returns the number of deleted jobs.
    #[instrument(name = "storage.remove_old_jobs", skip_all, fields(interval = %interval))]
    pub async fn remove_old_jobs(&self, interval: &Interval) -> Result<u64, sqlx::Error> {
        let Some(cutoff) = interval.before(Utc::now()) else {
            debug!("Interval reaches beyond the representable range, nothing to remove");
            return Ok(0);
        };

        let result = sqlx::query("DELETE FROM jobs WHERE stamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        debug!(removed = result.rows_affected(), %cutoff, "Removed old jobs");
        Ok(result.rows_affected())
    }

    /// Deletes a job. Deleting a job that does not exist is not an error.
    pub async fn remove_job(&self, job_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every job, returning how many were removed.
    pub async fn remove_all_jobs(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of persisted jobs.
    pub async fn fetch_job_count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
    }

    /// Finds the next job to run: lowest priority value first, oldest first
    /// among equal priorities.
    pub async fn fetch_job(&self) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r"
            SELECT id, task, data, priority, attempts, stamp
            FROM jobs
            ORDER BY priority ASC, id ASC
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Like [`Storage::fetch_job`], restricted to jobs with this task label.
    pub async fn fetch_job_for_task(&self, task: &str) -> Result<Option<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r"
            SELECT id, task, data, priority, attempts, stamp
            FROM jobs
            WHERE task = ?
            ORDER BY priority ASC, id ASC
            LIMIT 1
            ",
        )
        .bind(task)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta};
    use claims::{assert_none, assert_some};
    use insta::assert_compact_json_snapshot;
    use serde_json::json;

    async fn all_jobs(storage: &Storage) -> Result<Vec<(String, Value)>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, Json<Value>)>(
            "SELECT task, data FROM jobs ORDER BY id",
        )
        .fetch_all(storage.pool())
        .await?;
        Ok(rows.into_iter().map(|(task, Json(data))| (task, data)).collect())
    }

    async fn insert_with_stamp(
        storage: &Storage,
        task: &str,
        stamp: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (task, data, priority, attempts, stamp) VALUES (?, '{}', 0, 0, ?) RETURNING id",
        )
        .bind(task)
        .bind(stamp)
        .fetch_one(storage.pool())
        .await
    }

    #[tokio::test]
    async fn created_job_round_trips() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;

        let data = json!({ "user": 42, "tags": ["a", "b"] });
        let id = storage.create_job(&data, "taskA", 0).await?;

        let job = assert_some!(storage.fetch_job().await?);
        assert_eq!(job.id, id);
        assert_eq!(job.task, "taskA");
        assert_eq!(job.data, data);
        assert_eq!(job.priority, 0);
        assert_eq!(job.attempts, 0);
        assert!(job.stamp <= Utc::now());

        Ok(())
    }

    #[tokio::test]
    async fn fetch_job_on_empty_table_is_none() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        assert_none!(storage.fetch_job().await?);
        assert_none!(storage.fetch_job_for_task("taskA").await?);
        assert_eq!(storage.fetch_job_count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_job_orders_by_priority_then_age() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;

        let low = storage.create_job(&json!(1), "low", 5).await?;
        let first = storage.create_job(&json!(2), "first", 0).await?;
        let second = storage.create_job(&json!(3), "second", 0).await?;
        let middle = storage.create_job(&json!(4), "middle", 2).await?;

        let mut order = Vec::new();
        while let Some(job) = storage.fetch_job().await? {
            order.push(job.id);
            storage.remove_job(job.id).await?;
        }

        assert_eq!(order, vec![first, second, middle, low]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_attempts_do_not_change_selection_order() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;

        let older = storage.create_job(&json!(null), "a", 1).await?;
        storage.create_job(&json!(null), "b", 1).await?;

        assert_eq!(storage.increment_attempt_for_job(older).await?, Some(1));
        let job = assert_some!(storage.fetch_job().await?);
        assert_eq!(job.id, older);
        assert_eq!(job.attempts, 1);

        Ok(())
    }

    #[tokio::test]
    async fn fetch_job_for_task_filters_by_task() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;

        storage.create_job(&json!("x"), "other", 0).await?;
        let late = storage.create_job(&json!("late"), "mine", 3).await?;
        let urgent = storage.create_job(&json!("urgent"), "mine", 1).await?;

        let job = assert_some!(storage.fetch_job_for_task("mine").await?);
        assert_eq!(job.id, urgent);

        storage.remove_job(urgent).await?;
        let job = assert_some!(storage.fetch_job_for_task("mine").await?);
        assert_eq!(job.id, late);

        assert_none!(storage.fetch_job_for_task("missing").await?);
        Ok(())
    }

    #[tokio::test]
    async fn job_exists_for_task_tracks_rows() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        assert!(!storage.job_exists_for_task("sync").await?);

        let id = storage.create_job(&json!({}), "sync", 7).await?;
        assert!(storage.job_exists_for_task("sync").await?);
        assert!(!storage.job_exists_for_task("upload").await?);

        storage.remove_job(id).await?;
        assert!(!storage.job_exists_for_task("sync").await?);
        Ok(())
    }

    #[tokio::test]
    async fn increment_attempt_counts_up() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        let id = storage.create_job(&json!({}), "task", 0).await?;

        assert_eq!(storage.increment_attempt_for_job(id).await?, Some(1));
        assert_eq!(storage.increment_attempt_for_job(id).await?, Some(2));

        let job = assert_some!(storage.fetch_job().await?);
        assert_eq!(job.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn increment_attempt_on_missing_job_is_benign() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        assert_none!(storage.increment_attempt_for_job(12345).await?);
        Ok(())
    }

    #[tokio::test]
    async fn remove_job_is_idempotent() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        let id = storage.create_job(&json!({ "n": 1 }), "taskA", 0).await?;
        storage.create_job(&json!({ "n": 2 }), "taskB", 0).await?;

        storage.remove_job(id).await?;
        assert_compact_json_snapshot!(all_jobs(&storage).await?, @r#"[["taskB", {"n": 2}]]"#);

        storage.remove_job(id).await?;
        assert_compact_json_snapshot!(all_jobs(&storage).await?, @r#"[["taskB", {"n": 2}]]"#);
        Ok(())
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_removal() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        let first = storage.create_job(&json!({}), "a", 0).await?;
        storage.remove_all_jobs().await?;

        let second = storage.create_job(&json!({}), "a", 0).await?;
        assert!(second > first);
        Ok(())
    }

    #[tokio::test]
    async fn remove_all_jobs_empties_the_table() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        for i in 0..3 {
            storage.create_job(&json!(i), "bulk", i).await?;
        }
        assert_eq!(storage.fetch_job_count().await?, 3);

        assert_eq!(storage.remove_all_jobs().await?, 3);
        assert_eq!(storage.fetch_job_count().await?, 0);
        assert_eq!(storage.remove_all_jobs().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn remove_old_jobs_keeps_newer_rows() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        let now = Utc::now();

        insert_with_stamp(&storage, "ancient", now - TimeDelta::days(90)).await?;
        insert_with_stamp(&storage, "yesterday", now - TimeDelta::hours(25)).await?;
        insert_with_stamp(&storage, "recent", now - TimeDelta::hours(23)).await?;
        storage.create_job(&json!({}), "fresh", 0).await?;

        let removed = storage.remove_old_jobs(&"-1 day".parse::<Interval>()?).await?;
        assert_eq!(removed, 2);

        let tasks: Vec<String> = all_jobs(&storage)
            .await?
            .into_iter()
            .map(|(task, _)| task)
            .collect();
        assert_eq!(tasks, vec!["recent", "fresh"]);
        Ok(())
    }

    #[tokio::test]
    async fn remove_old_jobs_with_months() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        let now = Utc::now();

        insert_with_stamp(&storage, "old", now - TimeDelta::days(120)).await?;
        insert_with_stamp(&storage, "young", now - TimeDelta::days(30)).await?;

        assert_eq!(storage.remove_old_jobs(&Interval::months(3)).await?, 1);
        assert!(!storage.job_exists_for_task("old").await?);
        assert!(storage.job_exists_for_task("young").await?);
        Ok(())
    }

    #[tokio::test]
    async fn remove_old_jobs_with_huge_interval_removes_nothing() -> anyhow::Result<()> {
        let storage = Storage::in_memory().await?;
        storage.create_job(&json!({}), "kept", 0).await?;

        assert_eq!(storage.remove_old_jobs(&Interval::seconds(u64::MAX)).await?, 0);
        assert_eq!(storage.fetch_job_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn jobs_survive_reopening_the_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.sqlite");

        let storage = Storage::open(&path).await?;
        let id = storage.create_job(&json!({ "resume": true }), "taskA", 3).await?;
        storage.increment_attempt_for_job(id).await?;
        storage.close().await;

        let storage = Storage::open(&path).await?;
        let job = assert_some!(storage.fetch_job().await?);
        assert_eq!(job.id, id);
        assert_eq!(job.priority, 3);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.data, json!({ "resume": true }));
        storage.close().await;

        Ok(())
    }
}
