// System probe implementation
// reason: sysinfo for cross-platform memory/CPU monitoring
use async_trait::async_trait;
use std::sync::Mutex;
use sysinfo::{Pid, System};
use tracing::debug;

use freshet_core::port::system_probe::{SystemMetrics, SystemProbe};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// System probe implementation using sysinfo
///
/// Reports this process's resident memory, which is what the heavy gate
/// exists to bound.
pub struct SystemProbeImpl {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbeImpl {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbeImpl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SystemProbeImpl {
    async fn get_metrics(&self) -> SystemMetrics {
        let mut sys = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        sys.refresh_memory();
        sys.refresh_cpu();

        let process_memory_mb = self
            .pid
            .and_then(|pid| {
                sys.refresh_process(pid);
                sys.process(pid).map(|p| p.memory() / BYTES_PER_MB)
            })
            .unwrap_or(0);

        let metrics = SystemMetrics {
            process_memory_mb,
            memory_used_mb: sys.used_memory() / BYTES_PER_MB,
            memory_total_mb: sys.total_memory() / BYTES_PER_MB,
            cpu_usage_percent: sys.global_cpu_info().cpu_usage(),
        };

        debug!(
            process_mb = metrics.process_memory_mb,
            mem_used_mb = metrics.memory_used_mb,
            mem_total_mb = metrics.memory_total_mb,
            cpu = metrics.cpu_usage_percent,
            "System metrics collected"
        );

        metrics
    }
}
