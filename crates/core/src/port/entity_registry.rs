// Entity Registry Port (external collaborator)

use crate::domain::{DataDomain, EntityKey, Timestamp};
use crate::error::Result;
use async_trait::async_trait;

/// Supplies tracked entities and owns their per-domain staleness records
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn list_tracked_entities(&self) -> Result<Vec<EntityKey>>;

    /// Last successful refresh of the pair (epoch ms), if any
    async fn get_staleness(&self, entity_key: &str, domain: DataDomain)
        -> Result<Option<Timestamp>>;

    async fn set_staleness(
        &self,
        entity_key: &str,
        domain: DataDomain,
        updated_at: Timestamp,
    ) -> Result<()>;

    /// Drop the record so the pair is due on the next evaluation.
    ///
    /// Also bumps the pair's invalidation generation.
    async fn clear_staleness(&self, entity_key: &str, domain: DataDomain) -> Result<()>;

    /// Number of times the pair has been invalidated (0 if never)
    async fn staleness_generation(&self, entity_key: &str, domain: DataDomain) -> Result<i64>;

    /// Set staleness only if the pair is still at `generation`.
    ///
    /// Returns false and leaves the record alone when a `clear_staleness`
    /// landed after `generation` was read.
    async fn advance_staleness(
        &self,
        entity_key: &str,
        domain: DataDomain,
        generation: i64,
        updated_at: Timestamp,
    ) -> Result<bool>;
}

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRegistry {
        entities: Mutex<Vec<EntityKey>>,
        staleness: Mutex<HashMap<(EntityKey, DataDomain), Timestamp>>,
        generations: Mutex<HashMap<(EntityKey, DataDomain), i64>>,
        list_calls: AtomicUsize,
    }

    impl InMemoryRegistry {
        pub fn new(entities: impl IntoIterator<Item = impl Into<String>>) -> Self {
            Self {
                entities: Mutex::new(entities.into_iter().map(Into::into).collect()),
                ..Default::default()
            }
        }

        pub fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        pub fn staleness_of(&self, entity_key: &str, domain: DataDomain) -> Option<Timestamp> {
            self.staleness
                .lock()
                .unwrap()
                .get(&(entity_key.to_string(), domain))
                .copied()
        }

        /// Mark every domain of every entity as refreshed at `at`
        pub fn mark_all_fresh(&self, at: Timestamp) {
            let entities = self.entities.lock().unwrap().clone();
            let mut staleness = self.staleness.lock().unwrap();
            for entity in entities {
                for domain in DataDomain::ALL {
                    staleness.insert((entity.clone(), domain), at);
                }
            }
        }
    }

    #[async_trait]
    impl EntityRegistry for InMemoryRegistry {
        async fn list_tracked_entities(&self) -> Result<Vec<EntityKey>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entities.lock().unwrap().clone())
        }

        async fn get_staleness(
            &self,
            entity_key: &str,
            domain: DataDomain,
        ) -> Result<Option<Timestamp>> {
            Ok(self.staleness_of(entity_key, domain))
        }

        async fn set_staleness(
            &self,
            entity_key: &str,
            domain: DataDomain,
            updated_at: Timestamp,
        ) -> Result<()> {
            self.staleness
                .lock()
                .unwrap()
                .insert((entity_key.to_string(), domain), updated_at);
            Ok(())
        }

        async fn clear_staleness(&self, entity_key: &str, domain: DataDomain) -> Result<()> {
            let key = (entity_key.to_string(), domain);
            let mut generations = self.generations.lock().unwrap();
            self.staleness.lock().unwrap().remove(&key);
            *generations.entry(key).or_insert(0) += 1;
            Ok(())
        }

        async fn staleness_generation(
            &self,
            entity_key: &str,
            domain: DataDomain,
        ) -> Result<i64> {
            let key = (entity_key.to_string(), domain);
            Ok(self.generations.lock().unwrap().get(&key).copied().unwrap_or(0))
        }

        async fn advance_staleness(
            &self,
            entity_key: &str,
            domain: DataDomain,
            generation: i64,
            updated_at: Timestamp,
        ) -> Result<bool> {
            let key = (entity_key.to_string(), domain);
            let generations = self.generations.lock().unwrap();
            if generations.get(&key).copied().unwrap_or(0) != generation {
                return Ok(false);
            }
            self.staleness.lock().unwrap().insert(key, updated_at);
            Ok(true)
        }
    }
}
