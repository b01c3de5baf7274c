// Diagnostics - read-only snapshot of the orchestrator's state

use crate::application::gates::{ConcurrencyGates, GateOccupancy};
use crate::application::worker::{ShutdownToken, TaskOutcome, TaskRunner};
use crate::domain::{JobStatus, RunRecord};
use crate::error::{AppError, Result};
use crate::port::{JobStore, RunRecorder, SystemMetrics, SystemProbe};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Everything an operator needs to judge whether refreshes keep up
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub recent_runs: Vec<RunRecord>,
    pub gates: Vec<GateOccupancy>,
    pub jobs_by_status: BTreeMap<String, i64>,
    /// Claimed (`running`) jobs still queued for a gate slot
    pub awaiting_gate: i64,
    pub panics_caught: u64,
    pub active_tasks: usize,
    pub system: SystemMetrics,
}

pub struct DiagnosticsService {
    store: Arc<dyn JobStore>,
    recorder: Arc<dyn RunRecorder>,
    gates: Arc<ConcurrencyGates>,
    runner: TaskRunner,
    system_probe: Arc<dyn SystemProbe>,
}

impl DiagnosticsService {
    pub fn new(
        store: Arc<dyn JobStore>,
        recorder: Arc<dyn RunRecorder>,
        gates: Arc<ConcurrencyGates>,
        runner: TaskRunner,
        system_probe: Arc<dyn SystemProbe>,
    ) -> Self {
        Self {
            store,
            recorder,
            gates,
            runner,
            system_probe,
        }
    }

    pub async fn snapshot(&self, limit: usize) -> Result<DiagnosticsSnapshot> {
        let recent_runs = self.recorder.list_run_history(limit).await?;

        let mut jobs_by_status = BTreeMap::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let count = self.store.count_by_status(status).await?;
            jobs_by_status.insert(status.as_str().to_string(), count);
        }

        // Jobs are claimed before their gate wait, so `running` includes queued ones
        let gates = self.gates.occupancy();
        let executing: usize = gates.iter().map(|g| g.in_flight).sum();
        let running = jobs_by_status.get(JobStatus::Running.as_str()).copied().unwrap_or(0);
        let awaiting_gate = (running - executing as i64).max(0);

        Ok(DiagnosticsSnapshot {
            recent_runs,
            gates,
            jobs_by_status,
            awaiting_gate,
            panics_caught: self.runner.panics_caught(),
            active_tasks: self.runner.active_tasks(),
            system: self.system_probe.get_metrics().await,
        })
    }

    /// Log a compact snapshot (one line per gate plus totals)
    pub async fn log_snapshot(&self, limit: usize) -> Result<()> {
        let snapshot = self.snapshot(limit).await?;
        for gate in &snapshot.gates {
            info!(
                gate = gate.label,
                in_flight = gate.in_flight,
                peak = gate.peak_in_flight,
                capacity = gate.capacity,
                "Gate occupancy"
            );
        }
        let last_run = snapshot.recent_runs.first();
        info!(
            pending = snapshot.jobs_by_status.get("pending").copied().unwrap_or(0),
            running = snapshot.jobs_by_status.get("running").copied().unwrap_or(0),
            awaiting_gate = snapshot.awaiting_gate,
            failed = snapshot.jobs_by_status.get("failed").copied().unwrap_or(0),
            panics_caught = snapshot.panics_caught,
            active_tasks = snapshot.active_tasks,
            process_memory_mb = snapshot.system.process_memory_mb,
            last_run_errors = last_run.map(|r| r.errors),
            last_run_duration_ms = last_run.map(|r| r.duration_ms),
            "Diagnostics"
        );
        Ok(())
    }

    /// One `log_snapshot` pass inside the task runner
    pub async fn log_guarded(self: &Arc<Self>, limit: usize) -> Result<()> {
        let this = Arc::clone(self);
        let outcome = self
            .runner
            .run("diagnostics", async move { this.log_snapshot(limit).await })
            .await;

        match outcome {
            TaskOutcome::Finished(result) => result,
            other => Err(AppError::Internal(format!(
                "diagnostics pass {}",
                other.into_result().err().unwrap_or_default()
            ))),
        }
    }

    /// Log a snapshot every `every` until shutdown (first one after one period)
    pub async fn run(self, every: Duration, limit: usize, mut shutdown: ShutdownToken) {
        info!(interval_secs = every.as_secs(), "Diagnostics loop started");

        let this = Arc::new(self);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }

            if let Err(e) = this.log_guarded(limit).await {
                warn!(error = %e, "Diagnostics snapshot failed");
            }
        }

        info!("Diagnostics loop stopped");
    }
}
