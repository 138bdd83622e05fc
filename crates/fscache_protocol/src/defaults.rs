//! Canonical default values shared by the daemon, the scan worker and clients.

pub const DEFAULT_CACHE_ADDR: &str = "ipc:///tmp/fsc_cache";
pub const DEFAULT_RESULT_ADDR: &str = "ipc:///tmp/fsc_upd";
/// Milliseconds a client waits for a cache reply before giving up.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 250;
