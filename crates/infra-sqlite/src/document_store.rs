// SQLite FingerprintStore + SummarySink Implementation

use crate::map_sqlx_error;
use async_trait::async_trait;
use freshet_core::domain::{DocumentSummary, TemplateVersion};
use freshet_core::error::Result;
use freshet_core::port::{FingerprintStore, SummarySink, TimeProvider};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Processed-document fingerprints and the summaries derived from them
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Stored summaries for an entity, ordered by content hash
    pub async fn load_summaries(&self, entity_key: &str) -> Result<Vec<DocumentSummary>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT content_hash, summary FROM document_summaries
            WHERE entity_key = ?
            ORDER BY content_hash ASC
            "#,
        )
        .bind(entity_key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|(content_hash, summary)| -> Result<DocumentSummary> {
                Ok(DocumentSummary {
                    content_hash,
                    summary: serde_json::from_str(&summary)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl FingerprintStore for SqliteDocumentStore {
    async fn processed_fingerprints(
        &self,
        entity_key: &str,
        template_version: TemplateVersion,
    ) -> Result<HashSet<String>> {
        let hashes: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT content_hash FROM document_fingerprints
            WHERE entity_key = ? AND template_version = ?
            "#,
        )
        .bind(entity_key)
        .bind(template_version)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(hashes.into_iter().collect())
    }

    async fn record_fingerprints(
        &self,
        entity_key: &str,
        content_hashes: &[String],
        template_version: TemplateVersion,
    ) -> Result<()> {
        if content_hashes.is_empty() {
            return Ok(());
        }

        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Append-only: re-recording a fingerprint keeps the original row
        for hash in content_hashes {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO document_fingerprints
                    (entity_key, content_hash, template_version, recorded_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(entity_key)
            .bind(hash)
            .bind(template_version)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(
            entity = %entity_key,
            count = content_hashes.len(),
            template_version = template_version,
            "Fingerprints recorded"
        );
        Ok(())
    }

    async fn latest_template_version(&self) -> Result<Option<TemplateVersion>> {
        sqlx::query_scalar("SELECT MAX(template_version) FROM document_fingerprints")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl SummarySink for SqliteDocumentStore {
    async fn persist_summaries(
        &self,
        entity_key: &str,
        summaries: &[DocumentSummary],
    ) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for summary in summaries {
            let body = serde_json::to_string(&summary.summary)?;
            sqlx::query(
                r#"
                INSERT INTO document_summaries (entity_key, content_hash, summary, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(entity_key, content_hash)
                DO UPDATE SET summary = excluded.summary, updated_at = excluded.updated_at
                "#,
            )
            .bind(entity_key)
            .bind(&summary.content_hash)
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}
