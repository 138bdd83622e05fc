//! Wiring: bind endpoints, start the ticker and the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fscache_worker::CancellationToken;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::{Dispatcher, DispatcherInputs, DispatcherState, ShutdownSummary};
use crate::endpoints::{bind_rep, serve_cache_queries, serve_worker_results};
use crate::jobs::JobRegistry;
use crate::launcher::{launcher_for, ScanLauncher};
use crate::metrics::Metrics;
use crate::ticker::Ticker;

const TICK_CHANNEL_CAPACITY: usize = 4;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// A running daemon. Dropping it without [`shutdown`](Self::shutdown) leaves the tasks running.
pub struct ServerHandle {
    metrics: Arc<Metrics>,
    state: watch::Receiver<DispatcherState>,
    stop_ticker: CancellationToken,
    stop_queries: CancellationToken,
    stop_dispatcher: CancellationToken,
    stop_results: CancellationToken,
    ticker: JoinHandle<u64>,
    queries: JoinHandle<()>,
    results: JoinHandle<()>,
    dispatcher: JoinHandle<ShutdownSummary>,
}

/// Bind both endpoints and start serving with the configured isolation.
pub async fn start(registry: JobRegistry, config: DispatcherConfig) -> Result<ServerHandle> {
    let launcher = launcher_for(&config.isolation, &config.result_addr);
    start_with_launcher(registry, config, launcher).await
}

pub async fn start_with_launcher(
    registry: JobRegistry,
    config: DispatcherConfig,
    launcher: Box<dyn ScanLauncher>,
) -> Result<ServerHandle> {
    let cache_socket = bind_rep(&config.cache_addr)
        .await
        .context("Failed to bind cache-query endpoint")?;
    let result_socket = bind_rep(&config.result_addr)
        .await
        .context("Failed to bind worker-result endpoint")?;

    let (tick_tx, ticks) = mpsc::channel(TICK_CHANNEL_CAPACITY);
    let (lookup_tx, lookups) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
    let (submit_tx, submissions) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

    let metrics = Arc::new(Metrics::new());
    let tick_period = config.tick_period;
    let dispatcher = Dispatcher::new(registry, config, launcher, Arc::clone(&metrics));
    let state = dispatcher.subscribe();

    let stop_ticker = CancellationToken::new();
    let stop_queries = CancellationToken::new();
    let stop_dispatcher = CancellationToken::new();
    let stop_results = CancellationToken::new();

    let queries = tokio::spawn(serve_cache_queries(
        cache_socket,
        lookup_tx,
        Arc::clone(&metrics),
        stop_queries.clone(),
    ));
    let results = tokio::spawn(serve_worker_results(
        result_socket,
        submit_tx,
        Arc::clone(&metrics),
        stop_results.clone(),
    ));
    let dispatcher = tokio::spawn(dispatcher.run(
        DispatcherInputs {
            ticks,
            lookups,
            submissions,
        },
        stop_dispatcher.clone(),
    ));
    let ticker = Ticker::new(tick_period).spawn(tick_tx, stop_ticker.clone());

    info!("fscache serving");

    Ok(ServerHandle {
        metrics,
        state,
        stop_ticker,
        stop_queries,
        stop_dispatcher,
        stop_results,
        ticker,
        queries,
        results,
        dispatcher,
    })
}

impl ServerHandle {
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Wait until the dispatcher reaches `target` or `timeout` passes.
    pub async fn wait_for_state(&mut self, target: DispatcherState, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.state.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Graceful shutdown.
    ///
    /// Stops ticks and cache queries first, lets in-flight scans submit until
    /// the grace period runs out, then closes the worker-result endpoint.
    pub async fn shutdown(self) -> Result<ShutdownSummary> {
        info!("Shutting down");

        self.stop_ticker.cancel();
        self.stop_queries.cancel();
        if let Err(e) = self.queries.await {
            warn!("cache-query endpoint task failed: {}", e);
        }

        self.stop_dispatcher.cancel();
        let summary = self
            .dispatcher
            .await
            .context("Dispatcher task failed")?;

        self.stop_results.cancel();
        if let Err(e) = self.results.await {
            warn!("worker-result endpoint task failed: {}", e);
        }
        match self.ticker.await {
            Ok(dropped) if dropped > 0 => warn!("{} ticks were dropped while busy", dropped),
            Ok(_) => {}
            Err(e) => warn!("Ticker task failed: {}", e),
        }

        info!("fscache stopped");
        Ok(summary)
    }
}
