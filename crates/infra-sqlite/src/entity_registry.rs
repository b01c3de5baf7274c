// SQLite EntityRegistry Implementation

use crate::map_sqlx_error;
use async_trait::async_trait;
use freshet_core::domain::{DataDomain, EntityKey, Timestamp};
use freshet_core::error::{AppError, Result};
use freshet_core::port::{EntityRegistry, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Tracked entities and their per-domain staleness records
pub struct SqliteEntityRegistry {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteEntityRegistry {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Start tracking an entity. Returns false if it was already tracked.
    pub async fn track(&self, entity_key: &str) -> Result<bool> {
        if entity_key.trim().is_empty() {
            return Err(AppError::Validation("entity key must not be empty".to_string()));
        }

        let result =
            sqlx::query("INSERT OR IGNORE INTO tracked_entities (entity_key, added_at) VALUES (?, ?)")
                .bind(entity_key)
                .bind(self.time_provider.now_millis())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let added = result.rows_affected() == 1;
        if added {
            info!(entity = %entity_key, "Entity tracked");
        }
        Ok(added)
    }

    /// Stop tracking an entity and drop its staleness records.
    ///
    /// Job history is kept; maintenance GC removes it with the retention window.
    pub async fn untrack(&self, entity_key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for table in ["staleness", "staleness_generations"] {
            sqlx::query(&format!("DELETE FROM {} WHERE entity_key = ?", table))
                .bind(entity_key)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        let result = sqlx::query("DELETE FROM tracked_entities WHERE entity_key = ?")
            .bind(entity_key)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let removed = result.rows_affected() == 1;
        if removed {
            info!(entity = %entity_key, "Entity untracked");
        }
        Ok(removed)
    }
}

#[async_trait]
impl EntityRegistry for SqliteEntityRegistry {
    async fn list_tracked_entities(&self) -> Result<Vec<EntityKey>> {
        sqlx::query_scalar("SELECT entity_key FROM tracked_entities ORDER BY added_at ASC, entity_key ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_staleness(
        &self,
        entity_key: &str,
        domain: DataDomain,
    ) -> Result<Option<Timestamp>> {
        sqlx::query_scalar("SELECT updated_at FROM staleness WHERE entity_key = ? AND domain = ?")
            .bind(entity_key)
            .bind(domain.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn set_staleness(
        &self,
        entity_key: &str,
        domain: DataDomain,
        updated_at: Timestamp,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO staleness (entity_key, domain, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(entity_key, domain) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(entity_key)
        .bind(domain.as_str())
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn clear_staleness(&self, entity_key: &str, domain: DataDomain) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO staleness_generations (entity_key, domain, generation)
            VALUES (?, ?, 1)
            ON CONFLICT(entity_key, domain) DO UPDATE SET generation = generation + 1
            "#,
        )
        .bind(entity_key)
        .bind(domain.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM staleness WHERE entity_key = ? AND domain = ?")
            .bind(entity_key)
            .bind(domain.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn staleness_generation(&self, entity_key: &str, domain: DataDomain) -> Result<i64> {
        let generation: Option<i64> = sqlx::query_scalar(
            "SELECT generation FROM staleness_generations WHERE entity_key = ? AND domain = ?",
        )
        .bind(entity_key)
        .bind(domain.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(generation.unwrap_or(0))
    }

    async fn advance_staleness(
        &self,
        entity_key: &str,
        domain: DataDomain,
        generation: i64,
        updated_at: Timestamp,
    ) -> Result<bool> {
        // Single statement: the generation check and the upsert see the same snapshot
        let result = sqlx::query(
            r#"
            INSERT INTO staleness (entity_key, domain, updated_at)
            SELECT ?1, ?2, ?3
            WHERE COALESCE(
                (SELECT generation FROM staleness_generations
                 WHERE entity_key = ?1 AND domain = ?2),
                0
            ) = ?4
            ON CONFLICT(entity_key, domain) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(entity_key)
        .bind(domain.as_str())
        .bind(updated_at)
        .bind(generation)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use freshet_core::port::time_provider::mocks::ManualClock;

    async fn setup() -> (SqliteEntityRegistry, Arc<ManualClock>) {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(10));
        (SqliteEntityRegistry::new(pool, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_track_lists_in_insertion_order() {
        let (registry, clock) = setup().await;
        assert!(registry.track("MSFT").await.unwrap());
        clock.advance(1);
        assert!(registry.track("AAPL").await.unwrap());
        assert!(!registry.track("MSFT").await.unwrap());

        assert_eq!(
            registry.list_tracked_entities().await.unwrap(),
            vec!["MSFT".to_string(), "AAPL".to_string()]
        );

        assert!(matches!(
            registry.track("  ").await.unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_staleness_upsert_and_clear() {
        let (registry, _clock) = setup().await;
        registry.track("AAPL").await.unwrap();

        assert_eq!(registry.get_staleness("AAPL", DataDomain::Price).await.unwrap(), None);

        registry.set_staleness("AAPL", DataDomain::Price, 100).await.unwrap();
        registry.set_staleness("AAPL", DataDomain::Price, 250).await.unwrap();
        registry.set_staleness("AAPL", DataDomain::Documents, 90).await.unwrap();
        assert_eq!(
            registry.get_staleness("AAPL", DataDomain::Price).await.unwrap(),
            Some(250)
        );

        registry.clear_staleness("AAPL", DataDomain::Price).await.unwrap();
        assert_eq!(registry.get_staleness("AAPL", DataDomain::Price).await.unwrap(), None);
        assert_eq!(
            registry.get_staleness("AAPL", DataDomain::Documents).await.unwrap(),
            Some(90)
        );

        // Clearing a missing record is fine
        registry.clear_staleness("NVDA", DataDomain::Signals).await.unwrap();
    }

    #[tokio::test]
    async fn test_advance_refused_after_invalidation() {
        let (registry, _clock) = setup().await;
        registry.track("AAPL").await.unwrap();
        let domain = DataDomain::DocumentSummaries;

        assert_eq!(registry.staleness_generation("AAPL", domain).await.unwrap(), 0);
        assert!(registry.advance_staleness("AAPL", domain, 0, 100).await.unwrap());
        assert_eq!(registry.get_staleness("AAPL", domain).await.unwrap(), Some(100));

        // A job read generation 0, then the pair was invalidated under it
        registry.clear_staleness("AAPL", domain).await.unwrap();
        assert_eq!(registry.staleness_generation("AAPL", domain).await.unwrap(), 1);
        assert!(!registry.advance_staleness("AAPL", domain, 0, 200).await.unwrap());
        assert_eq!(registry.get_staleness("AAPL", domain).await.unwrap(), None);

        // A job that started after the clear may advance
        assert!(registry.advance_staleness("AAPL", domain, 1, 300).await.unwrap());
        assert!(registry.advance_staleness("AAPL", domain, 1, 400).await.unwrap());
        assert_eq!(registry.get_staleness("AAPL", domain).await.unwrap(), Some(400));

        // Generations are per pair
        assert_eq!(
            registry.staleness_generation("AAPL", DataDomain::Price).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_untrack_drops_staleness() {
        let (registry, _clock) = setup().await;
        registry.track("AAPL").await.unwrap();
        registry.set_staleness("AAPL", DataDomain::Price, 100).await.unwrap();

        assert!(registry.untrack("AAPL").await.unwrap());
        assert!(!registry.untrack("AAPL").await.unwrap());
        assert!(registry.list_tracked_entities().await.unwrap().is_empty());
        assert_eq!(registry.get_staleness("AAPL", DataDomain::Price).await.unwrap(), None);
    }
}
