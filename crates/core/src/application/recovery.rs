// Crash recovery logic (runs once per process start, before the first tick)
use crate::domain::{DataDomain, TemplateVersion};
use crate::error::Result;
use crate::port::{EntityRegistry, FingerprintStore, JobStore};
use std::sync::Arc;
use tracing::{info, warn};

/// What startup recovery changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs moved running -> pending
    pub orphans_reset: u64,
    /// Entities whose summaries were re-armed by a template bump
    pub summaries_rearmed: usize,
}

/// Crash recovery service
///
/// A job left `running` by a previous process can never finish: nothing is
/// executing it any more. Resetting it to `pending` lets the first tick
/// claim and dispatch it again (at-least-once).
pub struct StartupRecovery {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn EntityRegistry>,
    fingerprints: Arc<dyn FingerprintStore>,
    template_version: TemplateVersion,
}

impl StartupRecovery {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn EntityRegistry>,
        fingerprints: Arc<dyn FingerprintStore>,
        template_version: TemplateVersion,
    ) -> Self {
        Self {
            store,
            registry,
            fingerprints,
            template_version,
        }
    }

    /// Must complete before any claim in this process
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let orphans_reset = self.store.reset_orphaned().await?;
        if orphans_reset > 0 {
            warn!(count = orphans_reset, "Reset orphaned running jobs to pending");
        } else {
            info!("No orphaned jobs found");
        }

        let summaries_rearmed = self.check_template_version().await?;

        Ok(RecoveryReport {
            orphans_reset,
            summaries_rearmed,
        })
    }

    /// Re-arm document summaries when the extraction template changed.
    ///
    /// Nothing recorded yet means nothing to re-arm.
    async fn check_template_version(&self) -> Result<usize> {
        let latest = match self.fingerprints.latest_template_version().await? {
            Some(v) if v < self.template_version => v,
            _ => return Ok(0),
        };

        let entities = self.registry.list_tracked_entities().await?;
        for entity in &entities {
            self.registry
                .clear_staleness(entity, DataDomain::DocumentSummaries)
                .await?;
        }

        info!(
            previous_version = latest,
            template_version = self.template_version,
            entities = entities.len(),
            "Template version bumped, document summaries re-armed"
        );
        Ok(entities.len())
    }
}
