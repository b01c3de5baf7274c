// Worker - executes one claimed job inside its gate

pub mod constants;
mod panic_guard;
mod shutdown;

use constants::MAX_ERROR_LEN;
pub use panic_guard::{panic_message, TaskOutcome, TaskRunner};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::gates::ConcurrencyGates;
use crate::domain::{Job, JobStatus};
use crate::port::{
    EntityRegistry, FetchContext, FetchError, FetchOutcome, FetcherRegistry, JobStore,
    TimeProvider,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final disposition of a dispatched job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Fetch succeeded; job `completed` and staleness advanced
    Completed(FetchOutcome),
    /// Fetch failed or panicked; job `failed` (or left for recovery if the
    /// store write itself failed)
    Failed(String),
    /// Shutdown fired while waiting for a gate slot; job handed back to `pending`
    Requeued,
}

impl JobResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobResult::Failed(_))
    }
}

/// Runs claimed jobs: gate -> guarded fetch -> store outcome -> staleness
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn EntityRegistry>,
    fetchers: FetcherRegistry,
    gates: Arc<ConcurrencyGates>,
    runner: TaskRunner,
    time_provider: Arc<dyn TimeProvider>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn EntityRegistry>,
        fetchers: FetcherRegistry,
        gates: Arc<ConcurrencyGates>,
        runner: TaskRunner,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            fetchers,
            gates,
            runner,
            time_provider,
        }
    }

    /// Execute a job previously claimed (status `running`)
    pub async fn execute(&self, job: Job, mut shutdown: ShutdownToken) -> JobResult {
        debug_assert_eq!(job.status, JobStatus::Running);

        let permit = match self.gates.acquire(job.class, &mut shutdown).await {
            Ok(permit) => permit,
            Err(e) => {
                info!(job_id = %job.id, error = %e, "Handing job back to pending");
                if let Err(store_err) = self.store.requeue(&job.id).await {
                    // Left running; recovery resets it on next start
                    warn!(job_id = %job.id, error = %store_err, "Requeue failed");
                }
                return JobResult::Requeued;
            }
        };

        let Some(fetcher) = self.fetchers.get(job.domain) else {
            drop(permit);
            let msg = format!("no fetcher registered for domain '{}'", job.domain);
            return self.record_failure(&job, msg).await;
        };

        // Read before the fetch starts: an invalidation after this point
        // must survive the job's completion
        let generation = match self
            .registry
            .staleness_generation(&job.entity_key, job.domain)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                drop(permit);
                return self.record_failure(&job, format!("registry: {}", e)).await;
            }
        };

        let ctx = FetchContext {
            job_id: job.id.clone(),
            domain: job.domain,
            shutdown: shutdown.clone(),
        };
        let entity_key = job.entity_key.clone();
        let task_name = format!("{}:{}", job.domain, job.entity_key);

        debug!(job_id = %job.id, task = %task_name, "Fetch started");
        let outcome = self
            .runner
            .run(&task_name, async move { fetcher.fetch(&ctx, &entity_key).await })
            .await;
        drop(permit);

        match outcome {
            TaskOutcome::Finished(Ok(fetch_outcome)) => {
                self.record_success(&job, fetch_outcome, generation).await
            }
            TaskOutcome::Finished(Err(FetchError::Cancelled)) => {
                self.record_failure(&job, "cancelled by shutdown".to_string()).await
            }
            TaskOutcome::Finished(Err(e)) => self.record_failure(&job, e.to_string()).await,
            other => {
                let msg = match other.into_result() {
                    Err(msg) => msg,
                    Ok(_) => "unknown task outcome".to_string(),
                };
                self.record_failure(&job, msg).await
            }
        }
    }

    async fn record_success(&self, job: &Job, outcome: FetchOutcome, generation: i64) -> JobResult {
        if let Err(e) = self.store.complete(&job.id).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job completed");
            return JobResult::Failed(format!("store: {}", e));
        }

        let now = self.time_provider.now_millis();
        match self
            .registry
            .advance_staleness(&job.entity_key, job.domain, generation, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => info!(
                job_id = %job.id,
                entity = %job.entity_key,
                domain = %job.domain,
                "Pair invalidated during fetch; staleness left cleared"
            ),
            // Job is done; the pair is simply re-selected next tick
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to advance staleness"),
        }

        if outcome == FetchOutcome::Updated {
            for dependent in job.domain.dependents() {
                match self.registry.clear_staleness(&job.entity_key, *dependent).await {
                    Ok(()) => debug!(
                        entity = %job.entity_key,
                        domain = %dependent,
                        "Dependent domain invalidated"
                    ),
                    Err(e) => warn!(
                        entity = %job.entity_key,
                        domain = %dependent,
                        error = %e,
                        "Failed to invalidate dependent domain"
                    ),
                }
            }
        }

        info!(
            job_id = %job.id,
            entity = %job.entity_key,
            domain = %job.domain,
            outcome = ?outcome,
            "Job completed"
        );
        JobResult::Completed(outcome)
    }

    async fn record_failure(&self, job: &Job, message: String) -> JobResult {
        let message = truncate_error(&message);
        error!(
            job_id = %job.id,
            entity = %job.entity_key,
            domain = %job.domain,
            error = %message,
            "Job failed"
        );
        if let Err(e) = self.store.fail(&job.id, &message).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        JobResult::Failed(message)
    }
}

/// Cut an error message to `MAX_ERROR_LEN` bytes on a char boundary
fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
