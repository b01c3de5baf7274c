// Domain Fetcher Port
// One pluggable unit of work per data domain (price, fundamentals, documents, ...)

use crate::application::worker::ShutdownToken;
use crate::domain::{DataDomain, JobId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Fetch errors (all transient from the scheduler's point of view)
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Fetch failed: {0}")]
    Other(String),
}

impl From<crate::error::AppError> for FetchError {
    fn from(err: crate::error::AppError) -> Self {
        match err {
            crate::error::AppError::Fetch(inner) => inner,
            crate::error::AppError::Cancelled(_) => FetchError::Cancelled,
            other => FetchError::Other(other.to_string()),
        }
    }
}

/// Whether a successful fetch produced new data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Updated,
    Unchanged,
}

/// Per-invocation context handed to fetchers
#[derive(Clone)]
pub struct FetchContext {
    pub job_id: JobId,
    pub domain: DataDomain,
    /// Fires on process shutdown; long fetchers should stop early
    pub shutdown: ShutdownToken,
}

/// Fetcher for one data domain.
///
/// Invoked only after the job's gate slot is held, so any I/O done here
/// counts against that gate's capacity.
#[async_trait]
pub trait DomainFetcher: Send + Sync {
    async fn fetch(&self, ctx: &FetchContext, entity_key: &str)
        -> Result<FetchOutcome, FetchError>;
}

/// Domain -> fetcher table
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<DataDomain, Arc<dyn DomainFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, domain: DataDomain, fetcher: Arc<dyn DomainFetcher>) -> Self {
        self.fetchers.insert(domain, fetcher);
        self
    }

    pub fn get(&self, domain: DataDomain) -> Option<Arc<dyn DomainFetcher>> {
        self.fetchers.get(&domain).cloned()
    }

    pub fn contains(&self, domain: DataDomain) -> bool {
        self.fetchers.contains_key(&domain)
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Mock fetcher behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed with the given outcome
        Succeed(FetchOutcome),
        /// Always fail with message
        Fail(String),
        /// Panic with message (for panic isolation testing)
        Panic(String),
        /// Sleep, then succeed
        Sleep(Duration),
        /// Sleep, then fail with message
        SleepThenFail(Duration, String),
    }

    /// Scripted fetcher that also tracks how many calls run concurrently
    pub struct ScriptedFetcher {
        behavior: Mutex<MockBehavior>,
        call_count: AtomicUsize,
        active: AtomicUsize,
        peak_active: AtomicUsize,
        entities: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                call_count: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
                entities: Mutex::new(Vec::new()),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Succeed(FetchOutcome::Updated))
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        pub fn new_sleeping(duration: Duration) -> Self {
            Self::new(MockBehavior::Sleep(duration))
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Highest number of simultaneously executing calls observed
        pub fn peak_active(&self) -> usize {
            self.peak_active.load(Ordering::SeqCst)
        }

        /// Entities in call order
        pub fn entities(&self) -> Vec<String> {
            self.entities.lock().unwrap().clone()
        }
    }

    /// Decrements the active counter even when the call panics
    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DomainFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _ctx: &FetchContext,
            entity_key: &str,
        ) -> Result<FetchOutcome, FetchError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.entities.lock().unwrap().push(entity_key.to_string());

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_active.fetch_max(now_active, Ordering::SeqCst);
            let _active = ActiveGuard(&self.active);

            let behavior = self.behavior.lock().unwrap().clone();
            match behavior {
                MockBehavior::Succeed(outcome) => Ok(outcome),
                MockBehavior::Fail(msg) => Err(FetchError::Upstream(msg)),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
                MockBehavior::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(FetchOutcome::Updated)
                }
                MockBehavior::SleepThenFail(duration, msg) => {
                    tokio::time::sleep(duration).await;
                    Err(FetchError::Upstream(msg))
                }
            }
        }
    }
}
