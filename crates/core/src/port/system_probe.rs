// System resource monitoring port
// Memory is the resource the heavy gate protects, so diagnostics report it
use async_trait::async_trait;
use serde::Serialize;

/// System resource metrics
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub process_memory_mb: u64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub cpu_usage_percent: f32,
}

#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn get_metrics(&self) -> SystemMetrics;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    pub struct MockSystemProbe {
        metrics: Mutex<SystemMetrics>,
    }

    impl MockSystemProbe {
        pub fn new(process_memory_mb: u64) -> Self {
            Self {
                metrics: Mutex::new(SystemMetrics {
                    process_memory_mb,
                    memory_used_mb: 1024,
                    memory_total_mb: 2048,
                    cpu_usage_percent: 12.5,
                }),
            }
        }

        pub fn set_process_memory(&self, mb: u64) {
            self.metrics.lock().unwrap().process_memory_mb = mb;
        }
    }

    #[async_trait]
    impl SystemProbe for MockSystemProbe {
        async fn get_metrics(&self) -> SystemMetrics {
            self.metrics.lock().unwrap().clone()
        }
    }
}
