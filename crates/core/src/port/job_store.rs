// Job Store Port (Interface)

use crate::domain::{DataDomain, Job, JobId, JobStatus};
use crate::error::Result;
use async_trait::async_trait;

/// Result of an enqueue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was stored as `pending`
    Inserted(Job),
    /// A pending/running job already exists for the (entity, domain) pair;
    /// nothing was written
    AlreadyOutstanding(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Inserted(job) | EnqueueOutcome::AlreadyOutstanding(job) => job,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, EnqueueOutcome::Inserted(_))
    }
}

/// Durable store of jobs; single source of truth for job state.
///
/// Implementations must guarantee:
/// - at most one outstanding (pending/running) job per (entity_key, domain)
/// - `claim` is a compare-and-swap on status: two callers never both win
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job unless one is already outstanding for the pair
    async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome>;

    /// Atomically move pending -> running and stamp `started_at`.
    /// `None` if the job is not pending.
    ///
    /// Callers claim before waiting for a gate slot, so `running` covers
    /// both executing and gate-queued jobs.
    async fn claim(&self, id: &JobId) -> Result<Option<Job>>;

    /// running -> completed
    async fn complete(&self, id: &JobId) -> Result<()>;

    /// running -> failed, storing the error message
    async fn fail(&self, id: &JobId, error: &str) -> Result<()>;

    /// running -> pending for a claimed job that never started executing.
    /// Returns false if the job was not running.
    async fn requeue(&self, id: &JobId) -> Result<bool>;

    /// Bulk running -> pending. Call once per process start, before any claim.
    async fn reset_orphaned(&self) -> Result<u64>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Outstanding job for the pair, if any
    async fn find_outstanding(&self, entity_key: &str, domain: DataDomain) -> Result<Option<Job>>;

    /// Count jobs by status
    async fn count_by_status(&self, status: JobStatus) -> Result<i64>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use crate::port::TimeProvider;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory job store with the same invariants as the SQLite adapter
    pub struct InMemoryJobStore {
        jobs: Mutex<Vec<Job>>,
        time_provider: Arc<dyn TimeProvider>,
        unavailable: AtomicBool,
    }

    impl InMemoryJobStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                time_provider,
                unavailable: AtomicBool::new(false),
            }
        }

        /// Simulate an outage: every call fails with a database error
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Insert a job as-is (bypasses the uniqueness check; for crash simulation)
        pub fn insert_raw(&self, job: Job) {
            self.jobs.lock().unwrap().push(job);
        }

        pub fn all(&self) -> Vec<Job> {
            self.jobs.lock().unwrap().clone()
        }

        pub fn jobs_for(&self, entity_key: &str, domain: DataDomain) -> Vec<Job> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.entity_key == entity_key && j.domain == domain)
                .cloned()
                .collect()
        }

        fn check_available(&self) -> Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(AppError::Database("store unavailable".to_string()));
            }
            Ok(())
        }

        fn finish(&self, id: &JobId, error: Option<&str>) -> Result<()> {
            self.check_available()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs
                .iter_mut()
                .find(|j| &j.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
            match error {
                None => job.complete(now)?,
                Some(e) => job.fail(now, e)?,
            }
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn enqueue(&self, job: &Job) -> Result<EnqueueOutcome> {
            self.check_available()?;
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.iter().find(|j| {
                j.entity_key == job.entity_key && j.domain == job.domain && j.status.is_outstanding()
            }) {
                return Ok(EnqueueOutcome::AlreadyOutstanding(existing.clone()));
            }
            jobs.push(job.clone());
            Ok(EnqueueOutcome::Inserted(job.clone()))
        }

        async fn claim(&self, id: &JobId) -> Result<Option<Job>> {
            self.check_available()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.iter_mut().find(|j| &j.id == id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.start(now)?;
                    Ok(Some(job.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn complete(&self, id: &JobId) -> Result<()> {
            self.finish(id, None)
        }

        async fn fail(&self, id: &JobId, error: &str) -> Result<()> {
            self.finish(id, Some(error))
        }

        async fn requeue(&self, id: &JobId) -> Result<bool> {
            self.check_available()?;
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.iter_mut().find(|j| &j.id == id) {
                Some(job) if job.status == JobStatus::Running => {
                    job.requeue()?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn reset_orphaned(&self) -> Result<u64> {
            self.check_available()?;
            let mut jobs = self.jobs.lock().unwrap();
            let mut count = 0;
            for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
                job.requeue()?;
                count += 1;
            }
            Ok(count)
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            self.check_available()?;
            Ok(self.jobs.lock().unwrap().iter().find(|j| &j.id == id).cloned())
        }

        async fn find_outstanding(
            &self,
            entity_key: &str,
            domain: DataDomain,
        ) -> Result<Option<Job>> {
            self.check_available()?;
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .find(|j| {
                    j.entity_key == entity_key && j.domain == domain && j.status.is_outstanding()
                })
                .cloned())
        }

        async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
            self.check_available()?;
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.status == status)
                .count() as i64)
        }
    }
}
