// Maintenance Service
// Scheduled retention GC for jobs and run history

use crate::application::worker::{ShutdownToken, TaskOutcome, TaskRunner};
use crate::error::{AppError, Result};
use crate::port::{Maintenance, MaintenanceConfig, MaintenanceStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Maintenance scheduler
///
/// Runs periodic maintenance (GC, VACUUM) through the task runner
pub struct MaintenanceScheduler {
    maintenance: Arc<dyn Maintenance>,
    config: MaintenanceConfig,
    interval: Duration,
    runner: TaskRunner,
}

impl MaintenanceScheduler {
    /// Create a new maintenance scheduler
    ///
    /// # Arguments
    /// * `maintenance` - Maintenance implementation
    /// * `config` - Retention configuration
    /// * `interval_hours` - How often to run maintenance (hours)
    /// * `runner` - Task runner isolating each pass
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        interval_hours: u64,
        runner: TaskRunner,
    ) -> Self {
        Self {
            maintenance,
            config,
            interval: Duration::from_secs(interval_hours.max(1) * 3600),
            runner,
        }
    }

    /// Run maintenance loop until shutdown (first pass immediately)
    ///
    /// Spawned through the task runner by the daemon
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_days = self.config.retention_days,
            "Maintenance scheduler started"
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.run_now().await {
                error!(error = %e, "Scheduled maintenance failed");
            }
        }

        info!("Maintenance scheduler stopped");
    }

    /// Run one maintenance pass immediately
    pub async fn run_now(&self) -> Result<MaintenanceStats> {
        let maintenance = Arc::clone(&self.maintenance);
        let config = self.config.clone();

        let outcome = self
            .runner
            .run("maintenance", async move { maintenance.run_full_maintenance(&config).await })
            .await;

        let stats = match outcome {
            TaskOutcome::Finished(result) => result?,
            other => {
                return Err(AppError::Internal(format!(
                    "maintenance pass {}",
                    other.into_result().err().unwrap_or_default()
                )))
            }
        };

        info!(
            db_size_mb = stats.db_size_mb,
            job_count = stats.job_count,
            terminal_jobs = stats.terminal_job_count,
            run_count = stats.run_count,
            "Maintenance pass completed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::shutdown_channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingMaintenance {
        gc_calls: AtomicUsize,
        vacuums: AtomicUsize,
        db_size_mb: f64,
    }

    #[async_trait]
    impl Maintenance for CountingMaintenance {
        async fn vacuum(&self) -> Result<f64> {
            self.vacuums.fetch_add(1, Ordering::SeqCst);
            Ok(1.0)
        }

        async fn gc_finished_jobs(&self, _retention_days: i64) -> Result<i64> {
            self.gc_calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn gc_closed_runs(&self, _retention_days: i64) -> Result<i64> {
            Ok(1)
        }

        async fn get_stats(&self) -> Result<MaintenanceStats> {
            Ok(MaintenanceStats {
                db_size_mb: self.db_size_mb,
                job_count: 10,
                terminal_job_count: 7,
                run_count: 4,
            })
        }
    }

    struct PanickingMaintenance;

    #[async_trait]
    impl Maintenance for PanickingMaintenance {
        async fn vacuum(&self) -> Result<f64> {
            Ok(0.0)
        }

        async fn gc_finished_jobs(&self, _retention_days: i64) -> Result<i64> {
            panic!("gc crashed");
        }

        async fn gc_closed_runs(&self, _retention_days: i64) -> Result<i64> {
            Ok(0)
        }

        async fn get_stats(&self) -> Result<MaintenanceStats> {
            Ok(MaintenanceStats {
                db_size_mb: 0.0,
                job_count: 0,
                terminal_job_count: 0,
                run_count: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_vacuum_only_when_oversized() {
        let small = Arc::new(CountingMaintenance {
            db_size_mb: 10.0,
            ..Default::default()
        });
        let scheduler =
            MaintenanceScheduler::new(small.clone(), MaintenanceConfig::default(), 24, TaskRunner::new());
        scheduler.run_now().await.unwrap();
        assert_eq!(small.gc_calls.load(Ordering::SeqCst), 1);
        assert_eq!(small.vacuums.load(Ordering::SeqCst), 0);

        let big = Arc::new(CountingMaintenance {
            db_size_mb: 5000.0,
            ..Default::default()
        });
        let scheduler =
            MaintenanceScheduler::new(big.clone(), MaintenanceConfig::default(), 24, TaskRunner::new());
        scheduler.run_now().await.unwrap();
        assert_eq!(big.vacuums.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_pass_is_contained() {
        let runner = TaskRunner::new();
        let scheduler = MaintenanceScheduler::new(
            Arc::new(PanickingMaintenance),
            MaintenanceConfig::default(),
            24,
            runner.clone(),
        );

        let err = scheduler.run_now().await.unwrap_err();
        assert!(err.to_string().contains("gc crashed"));
        assert_eq!(runner.panics_caught(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_immediately_and_stops_on_shutdown() {
        let maintenance = Arc::new(CountingMaintenance::default());
        let scheduler =
            MaintenanceScheduler::new(maintenance.clone(), MaintenanceConfig::default(), 1, TaskRunner::new());
        let (tx, token) = shutdown_channel();

        let handle = tokio::spawn(scheduler.run(token));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(maintenance.gc_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(maintenance.gc_calls.load(Ordering::SeqCst), 2);

        tx.shutdown();
        handle.await.unwrap();
    }
}
