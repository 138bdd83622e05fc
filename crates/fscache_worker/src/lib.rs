//! Scan workers for the fscache daemon.
//!
//! A scan walks one job's root, captures every regular file whose full path
//! matches the job's pattern, and submits the finished mapping once to the
//! daemon's worker-result endpoint.

pub mod cancel;
pub mod frames;
pub mod scan;
pub mod submit;
pub mod walker;
pub mod worker;

pub use cancel::CancellationToken;
pub use scan::{run_scan, CaptureMode, PathPattern, ScanError, ScanJob};
pub use submit::{ResultSubmitter, SubmitError};
pub use walker::{TreeWalker, WalkEntry, WalkError};
pub use worker::{run_and_submit, scan_blocking, WorkerError};

use std::path::PathBuf;

/// Arguments of the `fscache-worker` binary: one scan, one submission.
#[derive(clap::Parser, Debug)]
#[command(name = "fscache-worker", about = "Run one fscache scan and submit the result")]
pub struct WorkerArgs {
    /// Job name reported with the result
    #[arg(long)]
    pub job: String,

    /// Directory to walk
    #[arg(long)]
    pub root: PathBuf,

    /// Regex matched against each full path, anchored at the start
    #[arg(long)]
    pub pattern: String,

    /// What to cache for each matching file
    #[arg(long, value_enum, default_value_t = CaptureMode::Content)]
    pub capture: CaptureMode,

    /// Worker-result endpoint of the daemon
    #[arg(
        long,
        env = "FSCACHE_RESULT_ADDR",
        default_value_t = fscache_protocol::defaults::DEFAULT_RESULT_ADDR.to_string()
    )]
    pub result_addr: String,
}

impl WorkerArgs {
    pub fn scan_job(&self) -> Result<ScanJob, regex::Error> {
        Ok(ScanJob {
            name: self.job.clone(),
            root: self.root.clone(),
            pattern: PathPattern::new(&self.pattern)?,
            capture: self.capture,
        })
    }
}
