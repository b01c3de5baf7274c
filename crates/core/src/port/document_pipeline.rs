// Document Pipeline Ports (incremental summarization collaborators)

use crate::domain::{Document, DocumentRef, DocumentSummary, TemplateVersion};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// Lists an entity's documents and loads their content on demand
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Metadata only; must not pull raw content
    async fn list_documents(&self, entity_key: &str) -> Result<Vec<DocumentRef>>;

    async fn load_content(&self, entity_key: &str, doc: &DocumentRef) -> Result<Document>;
}

/// Produces summaries for one batch of documents (AI extraction)
#[async_trait]
pub trait DocumentSummarizer: Send + Sync {
    async fn summarize(
        &self,
        entity_key: &str,
        batch: &[Document],
        template_version: TemplateVersion,
    ) -> Result<Vec<DocumentSummary>>;
}

/// Writes summaries onto the entity's record
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn persist_summaries(&self, entity_key: &str, summaries: &[DocumentSummary])
        -> Result<()>;
}

/// Append-only set of (entity, content_hash) pairs already summarized
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Hashes processed under exactly `template_version`
    async fn processed_fingerprints(
        &self,
        entity_key: &str,
        template_version: TemplateVersion,
    ) -> Result<HashSet<String>>;

    async fn record_fingerprints(
        &self,
        entity_key: &str,
        content_hashes: &[String],
        template_version: TemplateVersion,
    ) -> Result<()>;

    /// Highest template version ever recorded, if any
    async fn latest_template_version(&self) -> Result<Option<TemplateVersion>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fixed document list per entity; counts content loads
    #[derive(Default)]
    pub struct InMemoryDocuments {
        docs: Mutex<HashMap<String, Vec<DocumentRef>>>,
        loads: AtomicUsize,
    }

    impl InMemoryDocuments {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add `count` documents named `doc-<n>` for the entity
        pub fn with_documents(self, entity_key: &str, count: usize) -> Self {
            let refs = (1..=count)
                .map(|n| DocumentRef {
                    content_hash: format!("hash-{}", n),
                    title: format!("doc-{}", n),
                    locator: format!("mem://{}/{}", entity_key, n),
                })
                .collect();
            self.docs.lock().unwrap().insert(entity_key.to_string(), refs);
            self
        }

        pub fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentSource for InMemoryDocuments {
        async fn list_documents(&self, entity_key: &str) -> Result<Vec<DocumentRef>> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .get(entity_key)
                .cloned()
                .unwrap_or_default())
        }

        async fn load_content(&self, _entity_key: &str, doc: &DocumentRef) -> Result<Document> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Document {
                reference: doc.clone(),
                content: format!("raw content of {}", doc.title),
            })
        }
    }

    /// Summarizer that records batch sizes and can fail on a given batch
    #[derive(Default)]
    pub struct RecordingSummarizer {
        batches: Mutex<Vec<Vec<String>>>,
        fail_on_batch: Mutex<Option<usize>>,
        panic_on_batch: Mutex<Option<usize>>,
    }

    impl RecordingSummarizer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the n-th call (1-based)
        pub fn fail_on_batch(&self, n: usize) {
            *self.fail_on_batch.lock().unwrap() = Some(n);
        }

        /// Panic on the n-th call (1-based)
        pub fn panic_on_batch(&self, n: usize) {
            *self.panic_on_batch.lock().unwrap() = Some(n);
        }

        pub fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }

        pub fn summarized_hashes(&self) -> Vec<String> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl DocumentSummarizer for RecordingSummarizer {
        async fn summarize(
            &self,
            _entity_key: &str,
            batch: &[Document],
            template_version: TemplateVersion,
        ) -> Result<Vec<DocumentSummary>> {
            let call = {
                let mut batches = self.batches.lock().unwrap();
                batches.push(batch.iter().map(|d| d.content_hash().to_string()).collect());
                batches.len()
            };
            if *self.panic_on_batch.lock().unwrap() == Some(call) {
                panic!("summarizer exploded on batch {}", call);
            }
            if *self.fail_on_batch.lock().unwrap() == Some(call) {
                return Err(AppError::Internal(format!("summarizer failed on batch {}", call)));
            }
            Ok(batch
                .iter()
                .map(|d| DocumentSummary {
                    content_hash: d.content_hash().to_string(),
                    summary: serde_json::json!({
                        "title": d.reference.title,
                        "template_version": template_version,
                    }),
                })
                .collect())
        }
    }

    #[derive(Default)]
    pub struct InMemorySummarySink {
        persisted: Mutex<Vec<(String, DocumentSummary)>>,
        persist_calls: AtomicUsize,
    }

    impl InMemorySummarySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn persisted_hashes(&self, entity_key: &str) -> Vec<String> {
            self.persisted
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _)| e == entity_key)
                .map(|(_, s)| s.content_hash.clone())
                .collect()
        }

        pub fn persist_calls(&self) -> usize {
            self.persist_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SummarySink for InMemorySummarySink {
        async fn persist_summaries(
            &self,
            entity_key: &str,
            summaries: &[DocumentSummary],
        ) -> Result<()> {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            let mut persisted = self.persisted.lock().unwrap();
            for summary in summaries {
                persisted.push((entity_key.to_string(), summary.clone()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryFingerprints {
        recorded: Mutex<Vec<(String, String, TemplateVersion)>>,
    }

    impl InMemoryFingerprints {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FingerprintStore for InMemoryFingerprints {
        async fn processed_fingerprints(
            &self,
            entity_key: &str,
            template_version: TemplateVersion,
        ) -> Result<HashSet<String>> {
            Ok(self
                .recorded
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _, v)| e == entity_key && *v == template_version)
                .map(|(_, h, _)| h.clone())
                .collect())
        }

        async fn record_fingerprints(
            &self,
            entity_key: &str,
            content_hashes: &[String],
            template_version: TemplateVersion,
        ) -> Result<()> {
            let mut recorded = self.recorded.lock().unwrap();
            for hash in content_hashes {
                recorded.push((entity_key.to_string(), hash.clone(), template_version));
            }
            Ok(())
        }

        async fn latest_template_version(&self) -> Result<Option<TemplateVersion>> {
            Ok(self.recorded.lock().unwrap().iter().map(|(_, _, v)| *v).max())
        }
    }
}
