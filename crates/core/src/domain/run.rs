// Run Record Domain Model (one scheduler tick)

use crate::domain::job::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run ID (UUID v4)
pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observability record of a single tick. Never read back by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub status: RunStatus,
    pub entities_processed: i64,
    pub jobs_dispatched: i64,
    pub errors: i64,
    pub duration_ms: i64,
}

impl RunRecord {
    pub fn open(id: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            entities_processed: 0,
            jobs_dispatched: 0,
            errors: 0,
            duration_ms: 0,
        }
    }

    /// Close the run. A closed run is immutable; closing twice is a no-op.
    pub fn close(&mut self, completed_at: Timestamp, entities: i64, dispatched: i64, errors: i64) {
        if self.status == RunStatus::Completed {
            return;
        }
        self.status = RunStatus::Completed;
        self.completed_at = Some(completed_at);
        self.entities_processed = entities;
        self.jobs_dispatched = dispatched;
        self.errors = errors;
        self.duration_ms = (completed_at - self.started_at).max(0);
    }
}
