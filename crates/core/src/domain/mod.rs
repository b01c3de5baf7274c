// Domain Layer - Pure business logic and entities

pub mod document;
pub mod error;
pub mod job;
pub mod run;

// Re-exports
pub use document::{Document, DocumentRef, DocumentSummary, TemplateVersion};
pub use error::DomainError;
pub use job::{DataDomain, EntityKey, Job, JobClass, JobId, JobStatus, Priority, Timestamp};
pub use run::{RunId, RunRecord, RunStatus};
