// Incremental Document Batcher
//
// Summarizes only documents not yet fingerprinted under the current template,
// a few at a time, persisting after every batch so a failure or crash never
// loses finished work and peak memory stays at one batch of raw content.

use crate::application::worker::{ShutdownToken, TaskOutcome, TaskRunner};
use crate::domain::{DocumentRef, TemplateVersion};
use crate::error::{AppError, Result};
use crate::port::{
    DocumentSource, DocumentSummarizer, DomainFetcher, FetchContext, FetchError, FetchOutcome,
    FingerprintStore, SummarySink,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// What one batcher run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Size of every batch that was persisted, in order
    pub batch_sizes: Vec<usize>,
    /// Documents summarized in this run
    pub processed: usize,
    /// Documents skipped (already processed or duplicate listing)
    pub skipped: usize,
}

/// Unprocessed references, deduplicated by hash, listing order preserved
fn select_unprocessed(refs: Vec<DocumentRef>, processed: &HashSet<String>) -> Vec<DocumentRef> {
    let mut seen = HashSet::new();
    refs.into_iter()
        .filter(|r| !processed.contains(&r.content_hash) && seen.insert(r.content_hash.clone()))
        .collect()
}

pub struct DocumentBatcher {
    source: Arc<dyn DocumentSource>,
    summarizer: Arc<dyn DocumentSummarizer>,
    sink: Arc<dyn SummarySink>,
    fingerprints: Arc<dyn FingerprintStore>,
    runner: TaskRunner,
    batch_size: usize,
    template_version: TemplateVersion,
}

impl DocumentBatcher {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        summarizer: Arc<dyn DocumentSummarizer>,
        sink: Arc<dyn SummarySink>,
        fingerprints: Arc<dyn FingerprintStore>,
        runner: TaskRunner,
        batch_size: usize,
        template_version: TemplateVersion,
    ) -> Self {
        Self {
            source,
            summarizer,
            sink,
            fingerprints,
            runner,
            batch_size: batch_size.max(1),
            template_version,
        }
    }

    /// Summarize every unprocessed document of `entity_key`.
    ///
    /// A failing batch stops the run; batches before it stay persisted and
    /// fingerprinted, so the next run resumes after them.
    pub async fn process_entity(
        &self,
        entity_key: &str,
        shutdown: &ShutdownToken,
    ) -> Result<BatchReport> {
        let refs = self.source.list_documents(entity_key).await?;
        let listed = refs.len();
        let processed = self
            .fingerprints
            .processed_fingerprints(entity_key, self.template_version)
            .await?;
        let pending = select_unprocessed(refs, &processed);

        let mut report = BatchReport {
            skipped: listed - pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            debug!(entity = %entity_key, listed = listed, "No unprocessed documents");
            return Ok(report);
        }

        let total_batches = pending.len().div_ceil(self.batch_size);
        for (index, chunk) in pending.chunks(self.batch_size).enumerate() {
            let batch_no = index + 1;
            if shutdown.is_shutdown() {
                info!(
                    entity = %entity_key,
                    completed_batches = index,
                    total_batches = total_batches,
                    "Stopping document batches for shutdown"
                );
                return Err(AppError::Cancelled(format!(
                    "document batching for {} stopped after {} of {} batches",
                    entity_key, index, total_batches
                )));
            }

            let mut batch = Vec::with_capacity(chunk.len());
            for doc in chunk {
                batch.push(self.source.load_content(entity_key, doc).await?);
            }
            let hashes: Vec<String> = chunk.iter().map(|d| d.content_hash.clone()).collect();

            let summarizer = Arc::clone(&self.summarizer);
            let entity = entity_key.to_string();
            let version = self.template_version;
            let outcome = self
                .runner
                .run(&format!("summarize:{}:{}", entity_key, batch_no), async move {
                    let summaries = summarizer.summarize(&entity, &batch, version).await;
                    (summaries, batch)
                })
                .await;

            let (summaries, batch) = match outcome {
                TaskOutcome::Finished((Ok(summaries), batch)) => (summaries, batch),
                TaskOutcome::Finished((Err(e), _)) => {
                    error!(entity = %entity_key, batch = batch_no, error = %e, "Summarization failed");
                    return Err(e);
                }
                other => {
                    let reason = other.into_result().err().unwrap_or_default();
                    return Err(AppError::Internal(format!(
                        "summarizer {} on batch {} for {}",
                        reason, batch_no, entity_key
                    )));
                }
            };

            self.sink.persist_summaries(entity_key, &summaries).await?;
            drop(batch);
            self.fingerprints
                .record_fingerprints(entity_key, &hashes, self.template_version)
                .await?;

            debug!(
                entity = %entity_key,
                batch = batch_no,
                total_batches = total_batches,
                size = hashes.len(),
                "Document batch persisted"
            );
            report.batch_sizes.push(hashes.len());
            report.processed += hashes.len();
        }

        info!(
            entity = %entity_key,
            processed = report.processed,
            skipped = report.skipped,
            batches = report.batch_sizes.len(),
            template_version = self.template_version,
            "Document summaries refreshed"
        );
        Ok(report)
    }
}

#[async_trait]
impl DomainFetcher for DocumentBatcher {
    async fn fetch(&self, ctx: &FetchContext, entity_key: &str) -> std::result::Result<FetchOutcome, FetchError> {
        let report = self.process_entity(entity_key, &ctx.shutdown).await?;
        Ok(if report.processed > 0 {
            FetchOutcome::Updated
        } else {
            FetchOutcome::Unchanged
        })
    }
}
