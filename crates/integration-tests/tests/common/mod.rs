//! Shared wiring for the end-to-end tests: one "process" = one pool over a
//! database file plus the SQLite adapters and core services on top of it.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use freshet_core::application::{
    ConcurrencyGates, JobWorker, Scheduler, SchedulerConfig, SchedulerPorts, TaskRunner, TtlTable,
};
use freshet_core::port::id_provider::mocks::SequentialIds;
use freshet_core::port::time_provider::mocks::ManualClock;
use freshet_core::port::FetcherRegistry;
use freshet_infra_sqlite::{
    create_pool, run_migrations, SqliteDocumentStore, SqliteEntityRegistry, SqliteJobStore,
};
use sqlx::SqlitePool;

pub const START_MS: i64 = 1_700_000_000_000;

pub struct Node {
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteJobStore>,
    pub registry: Arc<SqliteEntityRegistry>,
    pub documents: Arc<SqliteDocumentStore>,
    pub gates: Arc<ConcurrencyGates>,
    pub runner: TaskRunner,
}

impl Node {
    pub async fn open(db: &Path) -> Self {
        let url = format!("sqlite://{}", db.display());
        Self::open_url(&url).await
    }

    pub async fn in_memory() -> Self {
        Self::open_url("sqlite::memory:").await
    }

    async fn open_url(url: &str) -> Self {
        let pool = create_pool(url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::new(START_MS));
        Self {
            store: Arc::new(SqliteJobStore::new(pool.clone(), clock.clone())),
            registry: Arc::new(SqliteEntityRegistry::new(pool.clone(), clock.clone())),
            documents: Arc::new(SqliteDocumentStore::new(pool.clone(), clock.clone())),
            gates: Arc::new(ConcurrencyGates::new(5, 1).unwrap()),
            runner: TaskRunner::new(),
            pool,
            clock,
        }
    }

    pub async fn track(&self, entities: &[&str]) {
        for entity in entities {
            self.registry.track(entity).await.unwrap();
        }
    }

    pub fn scheduler(&self, ttls: TtlTable, fetchers: FetcherRegistry, id_prefix: &str) -> Arc<Scheduler> {
        let worker = Arc::new(JobWorker::new(
            self.store.clone(),
            self.registry.clone(),
            fetchers,
            self.gates.clone(),
            self.runner.clone(),
            self.clock.clone(),
        ));
        let ports = SchedulerPorts {
            registry: self.registry.clone(),
            store: self.store.clone(),
            recorder: self.store.clone(),
            time_provider: self.clock.clone(),
            id_provider: Arc::new(SequentialIds::new(id_prefix)),
        };
        Arc::new(
            Scheduler::new(SchedulerConfig::default(), ttls, ports, worker, self.runner.clone())
                .unwrap(),
        )
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
