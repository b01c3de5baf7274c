// Worker constants (no magic values)
use std::time::Duration;

/// Stored job error messages are cut to this many bytes
pub const MAX_ERROR_LEN: usize = 2000;

/// Grace period between SIGTERM and SIGKILL for fetcher subprocesses (5s)
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Default interval between logged diagnostics snapshots (5 minutes)
pub const DEFAULT_DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default number of runs shown by diagnostics
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
