//! Scheduler loop - periodic evaluate-and-dispatch driver
//!
//! Every tick:
//! 1. open a RunRecord
//! 2. ask the staleness evaluator about every entity x domain
//! 3. enqueue + claim each due pair (the job store is the in-flight set)
//! 4. dispatch claimed jobs in priority order; each waits for its gate
//! 5. a finalizer closes the RunRecord once dispatched work finishes or the
//!    tick deadline passes
//!
//! The loop never waits for dispatched work, so a slow heavy job cannot
//! delay the next tick. The first scan after startup is staggered: a one-time
//! delay, then entities in chunks with a pause between chunks.

use crate::application::config::SchedulerConfig;
use crate::application::staleness::{StalenessEvaluator, TtlTable};
use crate::application::worker::{JobResult, JobWorker, ShutdownToken, TaskOutcome, TaskRunner};
use crate::domain::{DataDomain, EntityKey, Job, JobStatus, RunRecord, Timestamp};
use crate::error::Result;
use crate::port::{EnqueueOutcome, EntityRegistry, IdProvider, JobStore, RunRecorder, TimeProvider};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type DispatchHandle = JoinHandle<TaskOutcome<JobResult>>;

/// First scan is chunked; later scans walk every entity at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    Startup,
    Regular,
}

/// Collaborators of the scheduler
pub struct SchedulerPorts {
    pub registry: Arc<dyn EntityRegistry>,
    pub store: Arc<dyn JobStore>,
    pub recorder: Arc<dyn RunRecorder>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_provider: Arc<dyn IdProvider>,
}

/// Synchronous part of a tick; the run is closed later by `finalizer`
pub struct TickReport {
    pub run_id: String,
    pub entities_processed: i64,
    pub jobs_dispatched: i64,
    /// Errors seen while evaluating and dispatching (before any job ran)
    pub dispatch_errors: i64,
    /// Resolves to the closed RunRecord
    pub finalizer: JoinHandle<TaskOutcome<RunRecord>>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    evaluator: StalenessEvaluator,
    ports: SchedulerPorts,
    worker: Arc<JobWorker>,
    runner: TaskRunner,
    /// Failures that finished after their tick closed
    late_errors: Arc<AtomicI64>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        ttls: TtlTable,
        ports: SchedulerPorts,
        worker: Arc<JobWorker>,
        runner: TaskRunner,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            evaluator: StalenessEvaluator::new(Arc::clone(&ports.registry), ttls),
            config,
            ports,
            worker,
            runner,
            late_errors: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the loop until shutdown
    ///
    /// Should be spawned in tokio::spawn. Does not drain dispatched work;
    /// call `TaskRunner::drain` afterwards.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler disabled by configuration");
            return Ok(());
        }

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            startup_delay_ms = self.config.startup_delay.as_millis() as u64,
            ttl_domains = ?self.evaluator.ttls().domains(),
            "Scheduler started"
        );

        if !self.config.startup_delay.is_zero() {
            tokio::select! {
                _ = sleep(self.config.startup_delay) => {}
                _ = shutdown.wait() => {
                    info!("Scheduler interrupted during startup delay");
                    return Ok(());
                }
            }
        }

        self.guarded_tick(TickMode::Startup, &shutdown).await;

        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.is_shutdown() {
                break;
            }
            self.guarded_tick(TickMode::Regular, &shutdown).await;
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// One tick through the task runner; nothing it raises escapes the loop
    async fn guarded_tick(self: &Arc<Self>, mode: TickMode, shutdown: &ShutdownToken) {
        let this = Arc::clone(self);
        let token = shutdown.clone();
        let outcome = self
            .runner
            .run("scheduler-tick", async move { this.tick(mode, &token).await })
            .await;

        match outcome {
            TaskOutcome::Finished(Ok(report)) => debug!(
                run_id = %report.run_id,
                entities = report.entities_processed,
                dispatched = report.jobs_dispatched,
                "Tick dispatched"
            ),
            TaskOutcome::Finished(Err(e)) => error!(error = %e, "Tick failed"),
            TaskOutcome::Panicked(_) | TaskOutcome::Aborted => {
                warn!("Tick did not complete; continuing with next interval")
            }
        }
    }

    /// Evaluate every tracked entity and dispatch due work
    pub async fn tick(&self, mode: TickMode, shutdown: &ShutdownToken) -> Result<TickReport> {
        let started_at = self.ports.time_provider.now_millis();
        let run = RunRecord::open(self.ports.id_provider.generate_id(), started_at);
        let run_opened = match self.ports.recorder.open_run(&run).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Failed to record run start");
                false
            }
        };

        let entities = match self.ports.registry.list_tracked_entities().await {
            Ok(entities) => entities,
            Err(e) => {
                if run_opened {
                    let mut run = run;
                    let now = self.ports.time_provider.now_millis();
                    run.close(now, 0, 0, 1 + self.late_errors.swap(0, Ordering::SeqCst));
                    if let Err(close_err) = self.ports.recorder.close_run(&run).await {
                        warn!(run_id = %run.id, error = %close_err, "Failed to close run");
                    }
                }
                return Err(e);
            }
        };

        let chunk_size = match mode {
            TickMode::Startup => self.config.startup_chunk_size,
            TickMode::Regular => entities.len().max(1),
        };

        let mut handles = Vec::new();
        let mut entities_processed = 0i64;
        let mut errors = 0i64;

        for (index, chunk) in entities.chunks(chunk_size).enumerate() {
            if index > 0 {
                debug!(chunk = index, pause_ms = self.config.startup_chunk_pause.as_millis() as u64, "Startup chunk pause");
                let mut token = shutdown.clone();
                tokio::select! {
                    _ = sleep(self.config.startup_chunk_pause) => {}
                    _ = token.wait() => {}
                }
            }
            if shutdown.is_shutdown() {
                info!(chunk = index, "Tick interrupted by shutdown");
                break;
            }

            let now = self.ports.time_provider.now_millis();
            let (due, eval_errors) = self.collect_due(chunk, now).await;
            entities_processed += chunk.len() as i64;
            errors += eval_errors;

            for (entity, domain) in due {
                match self.enqueue_and_claim(&entity, domain, now).await {
                    Ok(Some(job)) => handles.push(self.dispatch(job, shutdown.clone())),
                    Ok(None) => {}
                    Err(e) => {
                        errors += 1;
                        warn!(entity = %entity, domain = %domain, error = %e, "Dispatch failed");
                    }
                }
            }
        }

        let jobs_dispatched = handles.len() as i64;
        info!(
            run_id = %run.id,
            mode = ?mode,
            entities = entities_processed,
            dispatched = jobs_dispatched,
            errors = errors,
            "Tick evaluated"
        );

        let finalizer = self.spawn_finalizer(
            run.clone(),
            run_opened,
            handles,
            entities_processed,
            errors,
            shutdown.clone(),
        );

        Ok(TickReport {
            run_id: run.id,
            entities_processed,
            jobs_dispatched,
            dispatch_errors: errors,
            finalizer,
        })
    }

    /// Due (entity, domain) pairs of a chunk, in priority order
    async fn collect_due(&self, chunk: &[EntityKey], now: Timestamp) -> (Vec<(EntityKey, DataDomain)>, i64) {
        let mut due = Vec::new();
        let mut errors = 0;
        for entity in chunk {
            match self.evaluator.due_domains(entity, now).await {
                Ok(domains) => due.extend(domains.into_iter().map(|d| (entity.clone(), d))),
                Err(e) => {
                    errors += 1;
                    warn!(entity = %entity, error = %e, "Staleness evaluation failed");
                }
            }
        }
        // Stable: entities keep listing order within a priority
        due.sort_by_key(|(_, domain)| domain.priority());
        (due, errors)
    }

    /// Enqueue the pair and claim the resulting pending job.
    ///
    /// `None` when the pair is already running or another claimer won.
    async fn enqueue_and_claim(&self, entity: &str, domain: DataDomain, now: Timestamp) -> Result<Option<Job>> {
        let job = Job::new(self.ports.id_provider.generate_id(), now, entity, domain);

        let candidate = match self.ports.store.enqueue(&job).await? {
            EnqueueOutcome::Inserted(job) => job,
            EnqueueOutcome::AlreadyOutstanding(existing) if existing.status == JobStatus::Pending => {
                debug!(job_id = %existing.id, entity = %entity, domain = %domain, "Picking up pending job");
                existing
            }
            EnqueueOutcome::AlreadyOutstanding(existing) => {
                debug!(job_id = %existing.id, entity = %entity, domain = %domain, "Already running, skipped");
                return Ok(None);
            }
        };

        // Claimed now, executed once the gate admits it
        self.ports.store.claim(&candidate.id).await
    }

    fn dispatch(&self, job: Job, shutdown: ShutdownToken) -> DispatchHandle {
        let worker = Arc::clone(&self.worker);
        let name = format!("job:{}:{}", job.domain, job.entity_key);
        self.runner
            .spawn(&name, async move { worker.execute(job, shutdown).await })
    }

    /// Close the run when every dispatched task finished, the deadline passed,
    /// or shutdown fired. Stragglers are handed to a collector whose failures
    /// roll into the next run that closes.
    fn spawn_finalizer(
        &self,
        mut run: RunRecord,
        run_opened: bool,
        handles: Vec<DispatchHandle>,
        entities_processed: i64,
        dispatch_errors: i64,
        mut shutdown: ShutdownToken,
    ) -> JoinHandle<TaskOutcome<RunRecord>> {
        let recorder = Arc::clone(&self.ports.recorder);
        let time_provider = Arc::clone(&self.ports.time_provider);
        let late_errors = Arc::clone(&self.late_errors);
        let deadline = self.config.tick_deadline;
        let dispatched = handles.len() as i64;
        let late_runner = self.runner.clone();

        self.runner.spawn("tick-finalizer", async move {
            let mut pending: FuturesUnordered<DispatchHandle> = handles.into_iter().collect();
            let mut errors = dispatch_errors;
            let timer = sleep(deadline);
            tokio::pin!(timer);

            let finished_in_time = loop {
                tokio::select! {
                    next = pending.next() => match next {
                        Some(result) => errors += is_failure(result) as i64,
                        None => break true,
                    },
                    _ = &mut timer => break false,
                    _ = shutdown.wait() => break false,
                }
            };

            if !finished_in_time {
                warn!(
                    run_id = %run.id,
                    still_running = pending.len(),
                    "Closing run before all dispatched jobs finished"
                );
            }

            errors += late_errors.swap(0, Ordering::SeqCst);
            run.close(time_provider.now_millis(), entities_processed, dispatched, errors);
            if run_opened {
                match recorder.close_run(&run).await {
                    Ok(()) => info!(
                        run_id = %run.id,
                        entities = run.entities_processed,
                        dispatched = run.jobs_dispatched,
                        errors = run.errors,
                        duration_ms = run.duration_ms,
                        "Run closed"
                    ),
                    Err(e) => warn!(run_id = %run.id, error = %e, "Failed to close run"),
                }
            }

            if !finished_in_time && !shutdown.is_shutdown() && !pending.is_empty() {
                late_runner.spawn("late-failures", async move {
                    loop {
                        tokio::select! {
                            next = pending.next() => match next {
                                Some(result) => {
                                    if is_failure(result) {
                                        late_errors.fetch_add(1, Ordering::SeqCst);
                                    }
                                }
                                None => break,
                            },
                            _ = shutdown.wait() => break,
                        }
                    }
                });
            }

            run
        })
    }
}

fn is_failure(result: std::result::Result<TaskOutcome<JobResult>, tokio::task::JoinError>) -> bool {
    match result {
        Ok(TaskOutcome::Finished(job_result)) => job_result.is_failure(),
        _ => true,
    }
}
