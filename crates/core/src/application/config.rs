// Scheduler Configuration (validated, runtime form)

use crate::domain::TemplateVersion;
use crate::error::{AppError, Result};
use std::time::Duration;

/// Tunables of the scheduler loop, gates and document batcher.
///
/// The daemon builds this from its layered settings; tests construct it
/// directly.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval
    pub interval: Duration,
    /// `false` disables the loop entirely
    pub enabled: bool,
    /// Capacity of the general (light) gate
    pub max_concurrent: usize,
    /// Capacity of the heavy gate
    pub heavy_job_limit: usize,
    /// One-time delay before the first scan
    pub startup_delay: Duration,
    /// Entities per chunk during the first scan
    pub startup_chunk_size: usize,
    /// Pause between first-scan chunks
    pub startup_chunk_pause: Duration,
    /// Documents per summarization batch
    pub batch_size: usize,
    /// How long a tick's finalizer waits for dispatched work
    pub tick_deadline: Duration,
    /// Grace period for running tasks at shutdown
    pub drain_timeout: Duration,
    /// Current document extraction template
    pub template_version: TemplateVersion,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            enabled: true,
            max_concurrent: 5,
            heavy_job_limit: 1,
            startup_delay: Duration::from_secs(10),
            startup_chunk_size: 25,
            startup_chunk_pause: Duration::from_secs(2),
            batch_size: 2,
            tick_deadline: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(30),
            template_version: 1,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AppError::Config("interval must be > 0".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(AppError::Config("max_concurrent must be > 0".to_string()));
        }
        if self.heavy_job_limit == 0 {
            return Err(AppError::Config("heavy_job_limit must be > 0".to_string()));
        }
        if self.startup_chunk_size == 0 {
            return Err(AppError::Config(
                "startup_chunk_size must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config("batch_size must be > 0".to_string()));
        }
        if self.template_version < 1 {
            return Err(AppError::Config(
                "template_version must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
