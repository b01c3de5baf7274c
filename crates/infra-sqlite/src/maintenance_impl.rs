// SQLite Maintenance Implementation (retention GC + VACUUM)
use crate::map_sqlx_error;
use async_trait::async_trait;
use freshet_core::error::Result;
use freshet_core::port::{Maintenance, MaintenanceStats, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// SQLite maintenance implementation
pub struct SqliteMaintenance {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteMaintenance {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    fn cutoff(&self, retention_days: i64) -> i64 {
        self.time_provider.now_millis() - retention_days * DAY_MS
    }

    /// Get DB file size in MB
    async fn get_db_size(&self) -> Result<f64> {
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok((page_count * page_size) as f64 / (1024.0 * 1024.0))
    }
}

#[async_trait]
impl Maintenance for SqliteMaintenance {
    async fn vacuum(&self) -> Result<f64> {
        info!("Running VACUUM to optimize database...");

        let size_before = self.get_db_size().await?;

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let size_after = self.get_db_size().await?;
        let reclaimed = (size_before - size_after).max(0.0);

        info!(
            size_before_mb = size_before,
            size_after_mb = size_after,
            reclaimed_mb = reclaimed,
            "VACUUM completed"
        );

        Ok(reclaimed)
    }

    async fn gc_finished_jobs(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.cutoff(retention_days);

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
            AND completed_at IS NOT NULL
            AND completed_at < ?
            "#,
        )
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_jobs = deleted, cutoff_time = cutoff_time, "Finished job GC completed");
        Ok(deleted)
    }

    async fn gc_closed_runs(&self, retention_days: i64) -> Result<i64> {
        let cutoff_time = self.cutoff(retention_days);

        let result = sqlx::query(
            r#"
            DELETE FROM runs
            WHERE status = 'completed'
            AND completed_at IS NOT NULL
            AND completed_at < ?
            "#,
        )
        .bind(cutoff_time)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = result.rows_affected() as i64;
        info!(deleted_runs = deleted, cutoff_time = cutoff_time, "Closed run GC completed");
        Ok(deleted)
    }

    async fn get_stats(&self) -> Result<MaintenanceStats> {
        let db_size_mb = self.get_db_size().await?;

        let job_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let terminal_job_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('completed', 'failed')")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let run_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(MaintenanceStats {
            db_size_mb,
            job_count,
            terminal_job_count,
            run_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, SqliteJobStore};
    use freshet_core::domain::{DataDomain, Job, RunRecord};
    use freshet_core::port::time_provider::mocks::ManualClock;
    use freshet_core::port::{JobStore, MaintenanceConfig, RunRecorder};

    async fn setup() -> (SqliteJobStore, SqliteMaintenance, Arc<ManualClock>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(0));
        (
            SqliteJobStore::new(pool.clone(), clock.clone()),
            SqliteMaintenance::new(pool, clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_maintenance_stats() {
        let (_store, maintenance, _clock) = setup().await;
        let stats = maintenance.get_stats().await.unwrap();

        assert!(stats.db_size_mb > 0.0);
        assert_eq!(stats.job_count, 0);
        assert_eq!(stats.terminal_job_count, 0);
        assert_eq!(stats.run_count, 0);
    }

    #[tokio::test]
    async fn test_vacuum() {
        let (_store, maintenance, _clock) = setup().await;
        let reclaimed = maintenance.vacuum().await.unwrap();
        assert!(reclaimed >= 0.0);
    }

    #[tokio::test]
    async fn test_gc_keeps_outstanding_and_recent() {
        let (store, maintenance, clock) = setup().await;

        let old_done = Job::new("old-done", 0, "AAPL", DataDomain::Price);
        let old_pending = Job::new("old-pending", 0, "MSFT", DataDomain::Price);
        let recent_failed = Job::new("recent-failed", 0, "NVDA", DataDomain::Price);
        for job in [&old_done, &old_pending, &recent_failed] {
            store.enqueue(job).await.unwrap();
        }
        store.claim(&old_done.id).await.unwrap();
        store.complete(&old_done.id).await.unwrap();

        let mut old_run = RunRecord::open("run-old", 0);
        store.open_run(&old_run).await.unwrap();
        old_run.close(10, 1, 1, 0);
        store.close_run(&old_run).await.unwrap();
        store.open_run(&RunRecord::open("run-open", 0)).await.unwrap();

        clock.set(9 * DAY_MS);
        store.claim(&recent_failed.id).await.unwrap();
        store.fail(&recent_failed.id, "boom").await.unwrap();

        assert_eq!(maintenance.gc_finished_jobs(7).await.unwrap(), 1);
        assert_eq!(maintenance.gc_closed_runs(7).await.unwrap(), 1);

        assert!(store.find_by_id(&old_done.id).await.unwrap().is_none());
        assert!(store.find_by_id(&old_pending.id).await.unwrap().is_some());
        assert!(store.find_by_id(&recent_failed.id).await.unwrap().is_some());

        let history = store.list_run_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "run-open");
    }

    #[tokio::test]
    async fn test_full_maintenance_vacuums_when_oversized() {
        let (_store, maintenance, _clock) = setup().await;
        let config = MaintenanceConfig {
            retention_days: 7,
            max_db_size_mb: 0.0,
        };

        let stats = maintenance.run_full_maintenance(&config).await.unwrap();
        assert_eq!(stats.job_count, 0);
    }
}
