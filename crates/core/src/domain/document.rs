// Document Domain Model (incremental summarization)

use serde::{Deserialize, Serialize};

/// Extraction template version. Fingerprints recorded under an older version
/// do not count as processed for a newer one.
pub type TemplateVersion = i64;

/// Lightweight reference to a document: listing these must stay cheap,
/// raw content is loaded per batch only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Content fingerprint (e.g. hash or accession number)
    pub content_hash: String,
    pub title: String,
    /// Source-specific locator passed back to `load_content`
    pub locator: String,
}

/// A document with its raw content loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub reference: DocumentRef,
    pub content: String,
}

impl Document {
    pub fn content_hash(&self) -> &str {
        &self.reference.content_hash
    }
}

/// Derived summary for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub content_hash: String,
    pub summary: serde_json::Value,
}
