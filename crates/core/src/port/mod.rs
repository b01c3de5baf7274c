// Port Layer - Interfaces for external collaborators

pub mod document_pipeline;
pub mod domain_fetcher;
pub mod entity_registry;
pub mod id_provider; // For deterministic testing
pub mod job_store;
pub mod maintenance;
pub mod run_recorder;
pub mod system_probe;
pub mod time_provider;

// Re-exports
pub use document_pipeline::{DocumentSource, DocumentSummarizer, FingerprintStore, SummarySink};
pub use domain_fetcher::{DomainFetcher, FetchContext, FetchError, FetchOutcome, FetcherRegistry};
pub use entity_registry::EntityRegistry;
pub use id_provider::IdProvider;
pub use job_store::{EnqueueOutcome, JobStore};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceStats};
pub use run_recorder::RunRecorder;
pub use system_probe::{SystemMetrics, SystemProbe};
pub use time_provider::TimeProvider;
