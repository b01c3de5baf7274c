// Freshet Infrastructure - SQLite Adapter
// Implements: JobStore, RunRecorder, EntityRegistry, FingerprintStore,
// SummarySink, Maintenance

mod connection;
mod document_store;
mod entity_registry;
mod error;
mod job_store;
mod maintenance_impl;
mod migration;

pub use connection::create_pool;
pub use document_store::SqliteDocumentStore;
pub use entity_registry::SqliteEntityRegistry;
pub use job_store::SqliteJobStore;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::{current_version, run_migrations};

pub(crate) use error::map_sqlx_error;

// Note: sqlx::Error conversion is handled by wrapping in helper functions
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
