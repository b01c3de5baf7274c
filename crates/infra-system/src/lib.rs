// Freshet Infrastructure - System Adapters
// Implements: DomainFetcher, DocumentSource, DocumentSummarizer, SystemProbe

pub mod command;
pub mod command_documents;
pub mod command_fetcher;
pub mod system_probe_impl;

pub use command::{CommandOutput, CommandRunner, CommandSpec};
pub use command_documents::{CommandDocumentSource, CommandSummarizer};
pub use command_fetcher::CommandFetcher;
pub use system_probe_impl::SystemProbeImpl;
