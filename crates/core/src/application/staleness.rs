// Staleness Evaluator

use crate::domain::{DataDomain, Timestamp};
use crate::error::Result;
use crate::port::EntityRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Refresh policy of one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Due once this much time passed since the last success
    Every(Duration),
    /// Due only while no record exists
    Permanent,
}

impl Ttl {
    pub fn minutes(m: u64) -> Self {
        Ttl::Every(Duration::from_secs(m * 60))
    }

    pub fn hours(h: u64) -> Self {
        Ttl::Every(Duration::from_secs(h * 3600))
    }

    pub fn days(d: u64) -> Self {
        Ttl::Every(Duration::from_secs(d * 86_400))
    }
}

/// True if the pair has never been refreshed or its TTL has elapsed
/// (`now - last >= ttl`, so exactly `ttl` is due).
pub fn is_due(last_updated: Option<Timestamp>, ttl: Ttl, now: Timestamp) -> bool {
    match (last_updated, ttl) {
        (None, _) => true,
        (Some(_), Ttl::Permanent) => false,
        (Some(last), Ttl::Every(period)) => {
            let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX);
            now.saturating_sub(last) >= period_ms
        }
    }
}

/// Domain -> TTL table. Only domains present here are ever scheduled.
#[derive(Debug, Clone)]
pub struct TtlTable {
    ttls: HashMap<DataDomain, Ttl>,
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new([
            (DataDomain::Price, Ttl::minutes(15)),
            (DataDomain::Fundamentals, Ttl::days(1)),
            (DataDomain::Signals, Ttl::hours(1)),
            (DataDomain::Documents, Ttl::days(30)),
            (DataDomain::DocumentSummaries, Ttl::Permanent),
            (DataDomain::AiTimeline, Ttl::days(7)),
        ])
    }
}

impl TtlTable {
    pub fn new(entries: impl IntoIterator<Item = (DataDomain, Ttl)>) -> Self {
        Self {
            ttls: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, domain: DataDomain) -> Option<Ttl> {
        self.ttls.get(&domain).copied()
    }

    pub fn set(&mut self, domain: DataDomain, ttl: Ttl) {
        self.ttls.insert(domain, ttl);
    }

    pub fn remove(&mut self, domain: DataDomain) {
        self.ttls.remove(&domain);
    }

    /// Scheduled domains, in dispatch priority order
    pub fn domains(&self) -> Vec<DataDomain> {
        let mut domains: Vec<_> = self.ttls.keys().copied().collect();
        domains.sort_by_key(|d| (d.priority(), *d));
        domains
    }
}

/// Decides which (entity, domain) pairs need a refresh
pub struct StalenessEvaluator {
    registry: Arc<dyn EntityRegistry>,
    ttls: TtlTable,
}

impl StalenessEvaluator {
    pub fn new(registry: Arc<dyn EntityRegistry>, ttls: TtlTable) -> Self {
        Self { registry, ttls }
    }

    pub fn ttls(&self) -> &TtlTable {
        &self.ttls
    }

    /// One registry read; domains missing from the table are never due
    pub async fn is_due(&self, entity_key: &str, domain: DataDomain, now: Timestamp) -> Result<bool> {
        let Some(ttl) = self.ttls.get(domain) else {
            return Ok(false);
        };
        let last = self.registry.get_staleness(entity_key, domain).await?;
        Ok(is_due(last, ttl, now))
    }

    /// Every due domain of `entity_key`, in priority order
    pub async fn due_domains(&self, entity_key: &str, now: Timestamp) -> Result<Vec<DataDomain>> {
        let mut due = Vec::new();
        for domain in self.ttls.domains() {
            if self.is_due(entity_key, domain, now).await? {
                due.push(domain);
            }
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::entity_registry::mocks::InMemoryRegistry;

    const MINUTE: i64 = 60_000;

    #[test]
    fn test_never_refreshed_is_due() {
        assert!(is_due(None, Ttl::minutes(15), 0));
        assert!(is_due(None, Ttl::Permanent, 0));
    }

    #[test]
    fn test_boundary_exactly_ttl_is_due() {
        let last = 1_000_000;
        assert!(is_due(Some(last), Ttl::minutes(15), last + 15 * MINUTE));
        assert!(!is_due(Some(last), Ttl::minutes(15), last + 15 * MINUTE - 1));
    }

    #[test]
    fn test_permanent_never_due_once_recorded() {
        assert!(!is_due(Some(0), Ttl::Permanent, i64::MAX));
    }

    #[test]
    fn test_clock_skew_not_due() {
        // Record from the future (clock moved backwards)
        assert!(!is_due(Some(10 * MINUTE), Ttl::minutes(1), 0));
    }

    #[test]
    fn test_domains_sorted_by_priority() {
        let table = TtlTable::default();
        assert_eq!(
            table.domains(),
            vec![
                DataDomain::Price,
                DataDomain::Fundamentals,
                DataDomain::Signals,
                DataDomain::Documents,
                DataDomain::DocumentSummaries,
                DataDomain::AiTimeline,
            ]
        );
    }

    #[tokio::test]
    async fn test_evaluator_reads_registry() {
        let registry = Arc::new(InMemoryRegistry::new(["AAPL"]));
        registry
            .set_staleness("AAPL", DataDomain::Price, 1_000)
            .await
            .unwrap();
        let evaluator = StalenessEvaluator::new(registry.clone(), TtlTable::default());

        assert!(!evaluator.is_due("AAPL", DataDomain::Price, 1_000 + MINUTE).await.unwrap());
        assert!(evaluator.is_due("AAPL", DataDomain::Price, 1_000 + 15 * MINUTE).await.unwrap());
        assert!(evaluator.is_due("AAPL", DataDomain::Fundamentals, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_domain_outside_table_never_due() {
        let registry = Arc::new(InMemoryRegistry::new(["AAPL"]));
        let table = TtlTable::new([(DataDomain::Price, Ttl::minutes(15))]);
        let evaluator = StalenessEvaluator::new(registry, table);

        assert!(!evaluator.is_due("AAPL", DataDomain::Signals, 0).await.unwrap());
        assert_eq!(
            evaluator.due_domains("AAPL", 0).await.unwrap(),
            vec![DataDomain::Price]
        );
    }
}
