//! fscache scan worker
//!
//! Usage:
//!     fscache-worker --job grains --root /var/cache/minions \
//!         --pattern '.*/data\.p$' --result-addr ipc:///tmp/fsc_upd

use anyhow::Context;
use clap::Parser;
use fscache_logging::{init_logging, LogConfig};
use fscache_worker::{run_and_submit, CancellationToken, WorkerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogConfig {
        app_name: "fscache-worker",
        verbose: false,
        to_file: false,
    })?;

    let args = WorkerArgs::parse();
    let job = args
        .scan_job()
        .with_context(|| format!("Invalid pattern for job '{}'", args.job))?;

    tracing::debug!(
        "Scanning job '{}' under {} -> {}",
        job.name,
        job.root.display(),
        args.result_addr
    );

    run_and_submit(job, &args.result_addr, CancellationToken::new())
        .await
        .context("Scan worker failed")?;

    Ok(())
}
