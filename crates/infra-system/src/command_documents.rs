// Command-backed document pipeline (DocumentSource + DocumentSummarizer)
use async_trait::async_trait;
use freshet_core::application::worker::ShutdownToken;
use freshet_core::domain::{Document, DocumentRef, DocumentSummary, TemplateVersion};
use freshet_core::error::Result;
use freshet_core::port::{DocumentSource, DocumentSummarizer, FetchError};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::command::{CommandRunner, CommandSpec};

/// Lists documents and loads their content through two external commands.
///
/// * `list` prints a JSON array of `{content_hash, title, locator}`
/// * `load` prints the raw content of one document (`{locator}` and
///   `{content_hash}` are substituted)
pub struct CommandDocumentSource {
    runner: Arc<CommandRunner>,
    list: CommandSpec,
    load: CommandSpec,
    shutdown: ShutdownToken,
}

impl CommandDocumentSource {
    pub fn new(
        runner: Arc<CommandRunner>,
        list: CommandSpec,
        load: CommandSpec,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            runner,
            list,
            load,
            shutdown,
        }
    }
}

#[async_trait]
impl DocumentSource for CommandDocumentSource {
    async fn list_documents(&self, entity_key: &str) -> Result<Vec<DocumentRef>> {
        let output = self
            .runner
            .run(&self.list, &[("entity", entity_key)], None, &self.shutdown)
            .await?;

        let docs: Vec<DocumentRef> = serde_json::from_str(output.stdout.trim())?;
        debug!(entity = %entity_key, count = docs.len(), "Documents listed");
        Ok(docs)
    }

    async fn load_content(&self, entity_key: &str, doc: &DocumentRef) -> Result<Document> {
        let vars = [
            ("entity", entity_key),
            ("locator", doc.locator.as_str()),
            ("content_hash", doc.content_hash.as_str()),
        ];
        let output = self
            .runner
            .run(&self.load, &vars, None, &self.shutdown)
            .await?;

        Ok(Document {
            reference: doc.clone(),
            content: output.stdout,
        })
    }
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    entity: &'a str,
    template_version: TemplateVersion,
    documents: Vec<SummarizeInput<'a>>,
}

#[derive(Serialize)]
struct SummarizeInput<'a> {
    content_hash: &'a str,
    title: &'a str,
    content: &'a str,
}

/// Summarizes one batch per invocation.
///
/// The batch goes to stdin as JSON; stdout must be a JSON array of
/// `{content_hash, summary}` with exactly one entry per document.
pub struct CommandSummarizer {
    runner: Arc<CommandRunner>,
    spec: CommandSpec,
    shutdown: ShutdownToken,
}

impl CommandSummarizer {
    pub fn new(runner: Arc<CommandRunner>, spec: CommandSpec, shutdown: ShutdownToken) -> Self {
        Self {
            runner,
            spec,
            shutdown,
        }
    }

    fn check_coverage(batch: &[Document], summaries: &[DocumentSummary]) -> Result<()> {
        let expected: HashSet<&str> = batch.iter().map(Document::content_hash).collect();
        let returned: HashSet<&str> = summaries.iter().map(|s| s.content_hash.as_str()).collect();

        if expected != returned || summaries.len() != batch.len() {
            return Err(FetchError::InvalidResponse(format!(
                "summarizer returned {} summaries for {} documents",
                summaries.len(),
                batch.len()
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentSummarizer for CommandSummarizer {
    async fn summarize(
        &self,
        entity_key: &str,
        batch: &[Document],
        template_version: TemplateVersion,
    ) -> Result<Vec<DocumentSummary>> {
        let request = SummarizeRequest {
            entity: entity_key,
            template_version,
            documents: batch
                .iter()
                .map(|doc| SummarizeInput {
                    content_hash: doc.content_hash(),
                    title: &doc.reference.title,
                    content: &doc.content,
                })
                .collect(),
        };
        let input = serde_json::to_vec(&request)?;

        let version = template_version.to_string();
        let vars = [("entity", entity_key), ("template_version", version.as_str())];
        let output = self
            .runner
            .run(&self.spec, &vars, Some(&input), &self.shutdown)
            .await?;

        let summaries: Vec<DocumentSummary> = serde_json::from_str(output.stdout.trim())?;
        Self::check_coverage(batch, &summaries)?;
        Ok(summaries)
    }
}
