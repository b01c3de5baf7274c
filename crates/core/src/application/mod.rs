// Application Layer - Use Cases and Scheduling

pub mod config;
pub mod diagnostics;
pub mod document_batcher;
pub mod gates;
pub mod maintenance;
pub mod recovery;
pub mod scheduler;
pub mod staleness;
pub mod worker;

// Re-exports
pub use config::SchedulerConfig;
pub use diagnostics::{DiagnosticsService, DiagnosticsSnapshot};
pub use document_batcher::{BatchReport, DocumentBatcher};
pub use gates::{ConcurrencyGates, Gate, GateError, GateOccupancy, GatePermit};
pub use maintenance::MaintenanceScheduler;
pub use recovery::{RecoveryReport, StartupRecovery};
pub use scheduler::{Scheduler, SchedulerPorts, TickMode, TickReport};
pub use staleness::{is_due, StalenessEvaluator, Ttl, TtlTable};
pub use worker::{
    shutdown_channel, JobResult, JobWorker, ShutdownSender, ShutdownToken, TaskOutcome, TaskRunner,
};
