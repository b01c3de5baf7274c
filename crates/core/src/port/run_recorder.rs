// Run Recorder Port

use crate::domain::RunRecord;
use crate::error::Result;
use async_trait::async_trait;

/// Durable record of scheduler ticks (observability only)
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Persist a freshly opened run
    async fn open_run(&self, run: &RunRecord) -> Result<()>;

    /// Persist the final state of a run. Closed runs are never modified again.
    async fn close_run(&self, run: &RunRecord) -> Result<()>;

    /// Most recent runs first
    async fn list_run_history(&self, limit: usize) -> Result<Vec<RunRecord>>;
}

pub mod mocks {
    use super::*;
    use crate::domain::RunStatus;
    use crate::error::AppError;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRunRecorder {
        runs: Mutex<Vec<RunRecord>>,
    }

    impl InMemoryRunRecorder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn all(&self) -> Vec<RunRecord> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RunRecorder for InMemoryRunRecorder {
        async fn open_run(&self, run: &RunRecord) -> Result<()> {
            self.runs.lock().unwrap().push(run.clone());
            Ok(())
        }

        async fn close_run(&self, run: &RunRecord) -> Result<()> {
            let mut runs = self.runs.lock().unwrap();
            let stored = runs
                .iter_mut()
                .find(|r| r.id == run.id)
                .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run.id)))?;
            if stored.status == RunStatus::Completed {
                return Err(AppError::InvalidState(format!("Run {} already closed", run.id)));
            }
            *stored = run.clone();
            Ok(())
        }

        async fn list_run_history(&self, limit: usize) -> Result<Vec<RunRecord>> {
            let runs = self.runs.lock().unwrap();
            Ok(runs.iter().rev().take(limit).cloned().collect())
        }
    }
}
