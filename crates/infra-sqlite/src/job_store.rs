// SQLite JobStore + RunRecorder Implementation

use crate::map_sqlx_error;
use async_trait::async_trait;
use freshet_core::domain::{DataDomain, Job, JobId, JobStatus, RunRecord, RunStatus};
use freshet_core::error::{AppError, Result};
use freshet_core::port::{EnqueueOutcome, JobStore, RunRecorder, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

/// Insert attempts before a vanished conflict is reported as an error
const ENQUEUE_ATTEMPTS: usize = 3;

pub struct SqliteJobStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Insert `job`; false if the id or an outstanding job for the pair exists.
    ///
    /// The partial unique index turns a duplicate outstanding job into a no-op.
    async fn insert_if_absent(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, entity_key, domain, class, priority, status,
                enqueued_at, started_at, completed_at, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.entity_key)
        .bind(job.domain.as_str())
        .bind(job.class.as_str())
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(job.enqueued_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    /// Shared by complete/fail: running -> terminal
    async fn finish(&self, id: &JobId, status: JobStatus, error: Option<&str>) -> Result<()> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, completed_at = ?, error = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(match self.find_by_id(id).await? {
                None => AppError::NotFound(format!("Job {} not found", id)),
                Some(job) => AppError::InvalidState(format!(
                    "Job {} is {}, cannot become {}",
                    id, job.status, status
                )),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome> {
        // The outstanding job can finish between a no-op insert and the
        // lookup; the pair is free again then, so insert again
        for _ in 0..ENQUEUE_ATTEMPTS {
            if self.insert_if_absent(job).await? {
                return Ok(EnqueueOutcome::Inserted(job.clone()));
            }

            if let Some(existing) = self.find_outstanding(&job.entity_key, job.domain).await? {
                debug!(
                    job_id = %existing.id,
                    entity = %job.entity_key,
                    domain = %job.domain,
                    "Enqueue skipped: job already outstanding"
                );
                return Ok(EnqueueOutcome::AlreadyOutstanding(existing));
            }
        }

        Err(AppError::Database(format!(
            "Job {} was not inserted (id already used)",
            job.id
        )))
    }

    async fn claim(&self, id: &JobId) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();

        // Compare-and-swap on status: only one caller sees the row
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn complete(&self, id: &JobId) -> Result<()> {
        self.finish(id, JobStatus::Completed, None).await
    }

    async fn fail(&self, id: &JobId, error: &str) -> Result<()> {
        self.finish(id, JobStatus::Failed, Some(error)).await
    }

    async fn requeue(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE id = ? AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_orphaned(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_outstanding(&self, entity_key: &str, domain: DataDomain) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE entity_key = ? AND domain = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(entity_key)
        .bind(domain.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl RunRecorder for SqliteJobStore {
    async fn open_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, started_at, completed_at, status,
                entities_processed, jobs_dispatched, errors, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(run.entities_processed)
        .bind(run.jobs_dispatched)
        .bind(run.errors)
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn close_run(&self, run: &RunRecord) -> Result<()> {
        // Closed rows are immutable: the status guard rejects a second close
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET completed_at = ?, status = ?, entities_processed = ?,
                jobs_dispatched = ?, errors = ?, duration_ms = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(run.entities_processed)
        .bind(run.jobs_dispatched)
        .bind(run.errors)
        .bind(run.duration_ms)
        .bind(&run.id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE id = ?")
                .bind(&run.id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            return Err(if exists == 0 {
                AppError::NotFound(format!("Run {} not found", run.id))
            } else {
                AppError::InvalidState(format!("Run {} already closed", run.id))
            });
        }
        Ok(())
    }

    async fn list_run_history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(RunRow::into_run).collect()
    }
}

/// SQLite row representation of a job
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    entity_key: String,
    domain: String,
    class: String,
    priority: i32,
    status: String,
    enqueued_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            entity_key: self.entity_key,
            domain: self.domain.parse()?,
            class: self.class.parse()?,
            priority: self.priority,
            status: self.status.parse()?,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: String,
    started_at: i64,
    completed_at: Option<i64>,
    status: String,
    entities_processed: i64,
    jobs_dispatched: i64,
    errors: i64,
    duration_ms: i64,
}

impl RunRow {
    fn into_run(self) -> Result<RunRecord> {
        let status = match self.status.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            other => {
                return Err(AppError::Database(format!(
                    "Unknown run status '{}' for run {}",
                    other, self.id
                )))
            }
        };

        Ok(RunRecord {
            id: self.id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status,
            entities_processed: self.entities_processed,
            jobs_dispatched: self.jobs_dispatched,
            errors: self.errors,
            duration_ms: self.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use freshet_core::port::time_provider::mocks::ManualClock;

    async fn setup_test_db() -> (SqliteJobStore, Arc<ManualClock>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        (SqliteJobStore::new(pool, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_enqueue_and_find() {
        let (store, _clock) = setup_test_db().await;
        let job = Job::new("job-1", 500, "AAPL", DataDomain::DocumentSummaries);

        let outcome = store.enqueue(&job).await.unwrap();
        assert!(outcome.is_inserted());

        let found = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_enqueue_is_noop() {
        let (store, _clock) = setup_test_db().await;
        let first = Job::new("job-1", 500, "AAPL", DataDomain::Price);
        let second = Job::new("job-2", 600, "AAPL", DataDomain::Price);

        store.enqueue(&first).await.unwrap();
        let outcome = store.enqueue(&second).await.unwrap();

        assert_eq!(outcome, EnqueueOutcome::AlreadyOutstanding(first.clone()));
        assert!(store.find_by_id(&second.id).await.unwrap().is_none());

        // Still a no-op while running
        store.claim(&first.id).await.unwrap().unwrap();
        assert!(!store.enqueue(&second).await.unwrap().is_inserted());

        // Once terminal, a new job for the pair is accepted
        store.complete(&first.id).await.unwrap();
        assert!(store.enqueue(&second).await.unwrap().is_inserted());
    }

    #[tokio::test]
    async fn test_enqueue_reused_id_is_an_error() {
        let (store, _clock) = setup_test_db().await;
        let job = Job::new("job-1", 500, "AAPL", DataDomain::Price);
        store.enqueue(&job).await.unwrap();
        store.claim(&job.id).await.unwrap().unwrap();
        store.complete(&job.id).await.unwrap();

        // Pair is free but the id is taken
        let reused = Job::new("job-1", 600, "AAPL", DataDomain::Price);
        assert!(matches!(
            store.enqueue(&reused).await.unwrap_err(),
            AppError::Database(msg) if msg.contains("id already used")
        ));

        let fresh = Job::new("job-2", 600, "AAPL", DataDomain::Price);
        assert!(store.enqueue(&fresh).await.unwrap().is_inserted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_enqueue_racing_completion_never_errors() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(SqliteJobStore::new(pool, Arc::new(ManualClock::new(1_000))));

        // Each racer enqueues and, when it wins, finishes the job right away,
        // so lookups often land just after the outstanding job completed
        let mut handles = Vec::new();
        for racer in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..50 {
                    let id = format!("job-{}-{}", racer, round);
                    let job = Job::new(id, 1_000, "AAPL", DataDomain::Price);
                    match store.enqueue(&job).await.unwrap() {
                        EnqueueOutcome::Inserted(job) => {
                            if store.claim(&job.id).await.unwrap().is_some() {
                                store.complete(&job.id).await.unwrap();
                            }
                        }
                        EnqueueOutcome::AlreadyOutstanding(_) => {}
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(store.count_by_status(JobStatus::Completed).await.unwrap() >= 1);
        assert!(store.find_outstanding("AAPL", DataDomain::Price).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_swap() {
        let (store, clock) = setup_test_db().await;
        let job = Job::new("job-1", 500, "AAPL", DataDomain::Price);
        store.enqueue(&job).await.unwrap();
        clock.set(2_000);

        let claimed = store.claim(&job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.started_at, Some(2_000));

        assert!(store.claim(&job.id).await.unwrap().is_none());
        assert!(store.claim(&"missing".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_records_error_and_rejects_pending() {
        let (store, clock) = setup_test_db().await;
        let job = Job::new("job-1", 500, "AAPL", DataDomain::Signals);
        store.enqueue(&job).await.unwrap();

        let err = store.fail(&job.id, "too early").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        store.claim(&job.id).await.unwrap();
        clock.set(3_000);
        store.fail(&job.id, "upstream 503").await.unwrap();

        let stored = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.completed_at, Some(3_000));
        assert_eq!(stored.error.as_deref(), Some("upstream 503"));

        let missing = store.complete(&"nope".to_string()).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reset_orphaned_and_requeue() {
        let (store, _clock) = setup_test_db().await;
        let a = Job::new("job-a", 1, "AAPL", DataDomain::Price);
        let b = Job::new("job-b", 2, "MSFT", DataDomain::Price);
        let c = Job::new("job-c", 3, "NVDA", DataDomain::Price);
        for job in [&a, &b, &c] {
            store.enqueue(job).await.unwrap();
            store.claim(&job.id).await.unwrap();
        }
        store.complete(&c.id).await.unwrap();

        assert!(store.requeue(&a.id).await.unwrap());
        assert!(!store.requeue(&a.id).await.unwrap());

        assert_eq!(store.reset_orphaned().await.unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 2);
        assert_eq!(store.count_by_status(JobStatus::Completed).await.unwrap(), 1);
        let b = store.find_by_id(&b.id).await.unwrap().unwrap();
        assert!(b.started_at.is_none());
    }

    #[tokio::test]
    async fn test_run_history_newest_first_and_close_once() {
        let (store, _clock) = setup_test_db().await;
        for n in 0..3i64 {
            let mut run = RunRecord::open(format!("run-{}", n), 1_000 * n);
            store.open_run(&run).await.unwrap();
            if n < 2 {
                run.close(1_000 * n + 250, 4, 2, n);
                store.close_run(&run).await.unwrap();
            }
        }

        let history = store.list_run_history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "run-2");
        assert_eq!(history[0].status, RunStatus::Running);
        assert_eq!(history[1].duration_ms, 250);
        assert_eq!(history[1].errors, 1);

        let mut closed = history[1].clone();
        closed.errors = 99;
        let err = store.close_run(&closed).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }
}
