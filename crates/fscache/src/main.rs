//! fscache daemon and query tool
//!
//! Usage:
//!     fscache serve --jobs /etc/fscache/jobs.json
//!     fscache get /var/cache/minions/web1/data.p

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fscache::{server, CacheClient, Cli, Command, GetArgs, JobRegistry, ServeArgs};
use fscache_logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            init_logging(LogConfig {
                app_name: "fscache",
                verbose: cli.verbose,
                to_file: true,
            })?;
            serve(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Get(args) => {
            init_logging(LogConfig {
                app_name: "fscache-get",
                verbose: cli.verbose,
                to_file: false,
            })?;
            get(args).await
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let registry = JobRegistry::load(&args.jobs)
        .with_context(|| format!("Invalid jobs file {}", args.jobs.display()))?;
    if registry.is_empty() {
        tracing::warn!("No jobs configured; the cache will stay empty");
    }
    let config = args.to_config()?;

    tracing::info!("Starting fscache");
    tracing::info!("  Jobs: {} from {}", registry.len(), args.jobs.display());
    tracing::info!("  Cache endpoint: {}", config.cache_addr);
    tracing::info!("  Result endpoint: {}", config.result_addr);
    tracing::info!("  Isolation: {:?}", config.isolation);

    let handle = server::start(registry, config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received");

    let summary = handle.shutdown().await?;
    tracing::info!(
        "Stopped with {} cached entries ({} scans terminated)",
        summary.cache_entries,
        summary.terminated
    );
    Ok(())
}

async fn get(args: GetArgs) -> anyhow::Result<ExitCode> {
    let mut client = CacheClient::connect(&args.cache_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", args.cache_addr))?
        .with_timeout(Duration::from_millis(args.timeout_ms));

    match client.get(&args.path).await? {
        Some(blob) => {
            println!("{}", String::from_utf8_lossy(&blob));
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("<absent>");
            Ok(ExitCode::from(1))
        }
    }
}
