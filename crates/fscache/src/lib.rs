//! fscache daemon library
//!
//! A scheduler that periodically re-walks configured directory trees on
//! isolated scan workers and serves the captured files from memory over a
//! ZeroMQ request/reply endpoint.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod jobs;
pub mod launcher;
pub mod metrics;
pub mod server;
pub mod store;
pub mod ticker;

pub use client::{CacheClient, ClientError};
pub use config::{DispatcherConfig, Isolation, OverlapPolicy};
pub use dispatcher::{Dispatcher, DispatcherState, ShutdownSummary};
pub use jobs::{ConfigError, Job, JobRegistry, JobSpec};
pub use launcher::{ProcessLauncher, ScanLauncher, TaskLauncher};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::ServerHandle;
pub use store::{BoundedStore, CacheStore, MemoryStore};
pub use ticker::{Tick, Ticker};

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use fscache_protocol::defaults::{DEFAULT_CACHE_ADDR, DEFAULT_QUERY_TIMEOUT_MS, DEFAULT_RESULT_ADDR};

#[derive(clap::Parser, Debug)]
#[command(name = "fscache", about = "Filesystem scan cache daemon", version)]
pub struct Cli {
    /// Mirror debug logs on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the daemon until Ctrl-C
    Serve(ServeArgs),
    /// Query the cache for one path
    Get(GetArgs),
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationArg {
    Task,
    Process,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// JSON file holding an array of jobs
    #[arg(long)]
    pub jobs: PathBuf,

    /// cache-query endpoint
    #[arg(long, env = "FSCACHE_CACHE_ADDR", default_value_t = DEFAULT_CACHE_ADDR.to_string())]
    pub cache_addr: String,

    /// worker-result endpoint
    #[arg(long, env = "FSCACHE_RESULT_ADDR", default_value_t = DEFAULT_RESULT_ADDR.to_string())]
    pub result_addr: String,

    /// Cap the cache, evicting the least recently merged paths (at least 1)
    #[arg(long)]
    pub max_entries: Option<NonZeroUsize>,

    /// Fire a job even while its previous scan is still running
    #[arg(long)]
    pub allow_overlap: bool,

    /// Where scans run
    #[arg(long, value_enum, default_value_t = IsolationArg::Task)]
    pub isolation: IsolationArg,

    /// Worker binary for process isolation (default: fscache-worker next to this binary)
    #[arg(long)]
    pub worker_exe: Option<PathBuf>,

    /// Seconds in-flight scans may keep running after shutdown is requested
    #[arg(long, default_value_t = 5)]
    pub grace_secs: u64,
}

impl ServeArgs {
    pub fn to_config(&self) -> anyhow::Result<DispatcherConfig> {
        let isolation = match self.isolation {
            IsolationArg::Task => Isolation::Task,
            IsolationArg::Process => Isolation::Process {
                worker_exe: match &self.worker_exe {
                    Some(path) => path.clone(),
                    None => default_worker_exe()?,
                },
            },
        };

        Ok(DispatcherConfig {
            cache_addr: self.cache_addr.clone(),
            result_addr: self.result_addr.clone(),
            shutdown_grace: Duration::from_secs(self.grace_secs),
            overlap: if self.allow_overlap {
                OverlapPolicy::Allow
            } else {
                OverlapPolicy::Skip
            },
            max_entries: self.max_entries,
            isolation,
            ..Default::default()
        })
    }
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    /// Path to look up
    pub path: String,

    /// cache-query endpoint
    #[arg(long, env = "FSCACHE_CACHE_ADDR", default_value_t = DEFAULT_CACHE_ADDR.to_string())]
    pub cache_addr: String,

    /// Milliseconds to wait for the reply
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_MS)]
    pub timeout_ms: u64,
}

/// `fscache-worker` in the same directory as the running executable.
fn default_worker_exe() -> anyhow::Result<PathBuf> {
    use anyhow::Context;
    let exe = std::env::current_exe().context("Cannot locate the running executable")?;
    let dir = exe
        .parent()
        .context("Running executable has no parent directory")?;
    Ok(dir.join(format!("fscache-worker{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_serve_args() {
        let cli = Cli::try_parse_from([
            "fscache",
            "-v",
            "serve",
            "--jobs",
            "jobs.json",
            "--cache-addr",
            "ipc:///tmp/c",
            "--result-addr",
            "ipc:///tmp/r",
            "--max-entries",
            "100",
            "--allow-overlap",
            "--isolation",
            "process",
            "--worker-exe",
            "/opt/fscache-worker",
            "--grace-secs",
            "2",
        ])
        .unwrap();
        assert!(cli.verbose);

        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.cache_addr, "ipc:///tmp/c");
        assert_eq!(config.result_addr, "ipc:///tmp/r");
        assert_eq!(config.max_entries, NonZeroUsize::new(100));
        assert_eq!(config.overlap, OverlapPolicy::Allow);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(
            config.isolation,
            Isolation::Process {
                worker_exe: PathBuf::from("/opt/fscache-worker")
            }
        );
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["fscache", "serve", "--jobs", "jobs.json"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.overlap, OverlapPolicy::Skip);
        assert_eq!(config.isolation, Isolation::Task);
        assert_eq!(config.max_entries, None);
        assert_eq!(config.tick_period, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_max_entries_is_rejected() {
        let parsed =
            Cli::try_parse_from(["fscache", "serve", "--jobs", "jobs.json", "--max-entries", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_get_args() {
        let cli = Cli::try_parse_from(["fscache", "get", "/m/a/data.p", "--timeout-ms", "50"]).unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.path, "/m/a/data.p");
        assert_eq!(args.timeout_ms, 50);
    }

    #[test]
    fn test_default_worker_exe_is_sibling() {
        let exe = default_worker_exe().unwrap();
        assert!(exe
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("fscache-worker"));
    }
}
