use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use fscache_protocol::defaults::{DEFAULT_CACHE_ADDR, DEFAULT_RESULT_ADDR};

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_STATS_EVERY_TICKS: u64 = 60;

/// What to do when a job is due while its previous scan is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Do not fire again; log and count the skip.
    #[default]
    Skip,
    /// Fire anyway; several scans of one job may run at once.
    Allow,
}

/// Where scans run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Isolation {
    /// On the daemon's blocking thread pool.
    #[default]
    Task,
    /// In a child `fscache-worker` process.
    Process { worker_exe: PathBuf },
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// cache-query endpoint (REP)
    pub cache_addr: String,
    /// worker-result endpoint (REP)
    pub result_addr: String,
    pub tick_period: Duration,
    /// Upper bound on one wait for input.
    pub poll_interval: Duration,
    /// How long in-flight scans may keep running after shutdown is requested.
    pub shutdown_grace: Duration,
    pub overlap: OverlapPolicy,
    /// Cap the cache; `None` grows without bound.
    pub max_entries: Option<NonZeroUsize>,
    pub isolation: Isolation,
    /// Log a metrics summary every this many ticks; 0 disables.
    pub stats_every_ticks: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cache_addr: DEFAULT_CACHE_ADDR.to_string(),
            result_addr: DEFAULT_RESULT_ADDR.to_string(),
            tick_period: DEFAULT_TICK_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            overlap: OverlapPolicy::default(),
            max_entries: None,
            isolation: Isolation::default(),
            stats_every_ticks: DEFAULT_STATS_EVERY_TICKS,
        }
    }
}
