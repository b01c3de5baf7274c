// Command-backed DomainFetcher
use async_trait::async_trait;
use freshet_core::port::{DomainFetcher, FetchContext, FetchError, FetchOutcome};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::command::{CommandRunner, CommandSpec};

/// Optional JSON report printed on stdout by a fetch command
#[derive(Debug, Deserialize)]
struct FetchReport {
    updated: bool,
}

/// Runs one external command per fetch: `{entity}` in the arguments is
/// replaced by the entity key.
///
/// Exit status 0 is success. Stdout may carry `{"updated": false}` to report
/// that nothing changed; empty stdout counts as updated.
pub struct CommandFetcher {
    runner: Arc<CommandRunner>,
    spec: CommandSpec,
}

impl CommandFetcher {
    pub fn new(runner: Arc<CommandRunner>, spec: CommandSpec) -> Self {
        Self { runner, spec }
    }

    fn parse_outcome(stdout: &str) -> Result<FetchOutcome, FetchError> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(FetchOutcome::Updated);
        }

        let report: FetchReport = serde_json::from_str(trimmed)
            .map_err(|e| FetchError::InvalidResponse(format!("expected {{\"updated\": bool}}: {}", e)))?;

        Ok(if report.updated {
            FetchOutcome::Updated
        } else {
            FetchOutcome::Unchanged
        })
    }
}

#[async_trait]
impl DomainFetcher for CommandFetcher {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        entity_key: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let vars = [
            ("entity", entity_key),
            ("domain", ctx.domain.as_str()),
            ("job_id", ctx.job_id.as_str()),
        ];

        let output = self
            .runner
            .run(&self.spec, &vars, None, &ctx.shutdown)
            .await?;

        let outcome = Self::parse_outcome(&output.stdout)?;
        debug!(
            entity = %entity_key,
            domain = %ctx.domain,
            outcome = ?outcome,
            duration_ms = output.duration_ms,
            "Command fetch finished"
        );
        Ok(outcome)
    }
}
