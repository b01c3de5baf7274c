// Job Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job ID (UUID v4)
pub type JobId = String;

/// Key of a tracked entity (e.g. an instrument symbol)
pub type EntityKey = String;

/// Priority (lower number = dispatched sooner)
pub type Priority = i32;

/// Epoch milliseconds
pub type Timestamp = i64;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Outstanding jobs block a second enqueue for the same (entity, domain)
    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Concurrency class: decides which gate a job must acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    /// Cheap numeric fetches (general gate)
    Light,
    /// Document / AI processing (heavy gate)
    Heavy,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::Light => "light",
            JobClass::Heavy => "heavy",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "light" => Ok(JobClass::Light),
            "heavy" => Ok(JobClass::Heavy),
            other => Err(DomainError::ValidationError(format!(
                "unknown job class: {}",
                other
            ))),
        }
    }
}

/// Upstream data domain refreshed for each entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataDomain {
    Price,
    Fundamentals,
    Documents,
    DocumentSummaries,
    AiTimeline,
    Signals,
}

impl DataDomain {
    pub const ALL: [DataDomain; 6] = [
        DataDomain::Price,
        DataDomain::Fundamentals,
        DataDomain::Documents,
        DataDomain::DocumentSummaries,
        DataDomain::AiTimeline,
        DataDomain::Signals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataDomain::Price => "price",
            DataDomain::Fundamentals => "fundamentals",
            DataDomain::Documents => "documents",
            DataDomain::DocumentSummaries => "document_summaries",
            DataDomain::AiTimeline => "ai_timeline",
            DataDomain::Signals => "signals",
        }
    }

    /// Gate class for this domain's jobs
    pub fn class(&self) -> JobClass {
        match self {
            DataDomain::Price | DataDomain::Fundamentals | DataDomain::Signals => JobClass::Light,
            DataDomain::Documents | DataDomain::DocumentSummaries | DataDomain::AiTimeline => {
                JobClass::Heavy
            }
        }
    }

    /// Dispatch priority (cheap, time-sensitive data first)
    pub fn priority(&self) -> Priority {
        match self {
            DataDomain::Price => 0,
            DataDomain::Fundamentals => 10,
            DataDomain::Signals => 20,
            DataDomain::Documents => 30,
            DataDomain::DocumentSummaries => 40,
            DataDomain::AiTimeline => 50,
        }
    }

    /// Domains derived from this one's output.
    ///
    /// Their staleness is cleared whenever this domain reports new data.
    pub fn dependents(&self) -> &'static [DataDomain] {
        match self {
            DataDomain::Documents => &[DataDomain::DocumentSummaries, DataDomain::AiTimeline],
            _ => &[],
        }
    }
}

impl fmt::Display for DataDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataDomain {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        DataDomain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| DomainError::UnknownDomain(s.to_string()))
    }
}

/// Job Entity: one unit of work for one (entity, domain) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub entity_key: EntityKey,
    pub domain: DataDomain,
    pub class: JobClass,
    pub priority: Priority,
    pub status: JobStatus,

    pub enqueued_at: Timestamp,
    /// Claim time. A claimed job may still be queued for its gate slot,
    /// so this is not when the fetch began.
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,

    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job
    ///
    /// ID and timestamp are injected (never generated here) so callers stay
    /// deterministic under test. Class and priority come from the domain.
    pub fn new(
        id: impl Into<String>,
        enqueued_at: Timestamp,
        entity_key: impl Into<String>,
        domain: DataDomain,
    ) -> Self {
        Self {
            id: id.into(),
            entity_key: entity_key.into(),
            domain,
            class: domain.class(),
            priority: domain.priority(),
            status: JobStatus::Pending,
            enqueued_at,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Create a job with a deterministic ID (test-1, test-2, ...) and timestamp.
    ///
    /// **Note**: tests only. Production code injects ID and time via providers.
    pub fn new_test(entity_key: impl Into<String>, domain: DataDomain) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self::new(
            format!("test-{}", counter),
            (counter * 1000) as i64,
            entity_key,
            domain,
        )
    }

    /// pending -> running
    pub fn start(&mut self, now_millis: Timestamp) -> Result<()> {
        self.transition(JobStatus::Pending, JobStatus::Running)?;
        self.started_at = Some(now_millis);
        Ok(())
    }

    /// running -> completed
    pub fn complete(&mut self, now_millis: Timestamp) -> Result<()> {
        self.transition(JobStatus::Running, JobStatus::Completed)?;
        self.completed_at = Some(now_millis);
        self.error = None;
        Ok(())
    }

    /// running -> failed
    pub fn fail(&mut self, now_millis: Timestamp, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Running, JobStatus::Failed)?;
        self.completed_at = Some(now_millis);
        self.error = Some(error.into());
        Ok(())
    }

    /// running -> pending (orphan reset or abandoned gate wait)
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(JobStatus::Running, JobStatus::Pending)?;
        self.started_at = None;
        Ok(())
    }

    fn transition(&mut self, from: JobStatus, to: JobStatus) -> Result<()> {
        if self.status != from {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}
