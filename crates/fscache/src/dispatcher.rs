//! The Dispatcher: single owner of the cache store.
//!
//! One task multiplexes three inputs:
//!
//! - ticks from the [`Ticker`](crate::ticker::Ticker), which fire due jobs
//! - cache lookups forwarded by the cache-query endpoint
//! - worker submissions forwarded by the worker-result endpoint
//!
//! Each loop iteration reaps finished workers, then waits (bounded by
//! `poll_interval`) for whichever input is ready first and handles exactly
//! one event. Branch selection is randomized so no input starves the others.
//!
//! The store is mutated only here, only while handling a submission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fscache_protocol::{decode_submission, CacheQuery, CacheReply, ScanOutcome};
use fscache_worker::CancellationToken;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{DispatcherConfig, OverlapPolicy};
use crate::jobs::{Job, JobRegistry};
use crate::launcher::{ScanLauncher, WorkerHandle};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::store::{BoundedStore, CacheStore, MemoryStore};
use crate::ticker::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// All inputs are bound; ticks, lookups and results are handled.
    Serving,
    /// Shutdown requested: lookups and ticks are refused, results still merge
    /// until in-flight workers finish or the grace period ends.
    Draining,
    /// Terminal.
    Stopped,
}

/// A cache lookup waiting for its answer.
#[derive(Debug)]
pub struct LookupRequest {
    pub query: CacheQuery,
    pub reply: oneshot::Sender<CacheReply>,
}

/// A raw worker submission. `ack` fires before the payload is classified.
#[derive(Debug)]
pub struct Submission {
    pub payload: Vec<u8>,
    pub ack: oneshot::Sender<()>,
}

/// Receiving ends of the dispatcher's three inputs.
pub struct DispatcherInputs {
    pub ticks: mpsc::Receiver<Tick>,
    pub lookups: mpsc::Receiver<LookupRequest>,
    pub submissions: mpsc::Receiver<Submission>,
}

/// What the dispatcher leaves behind when it stops.
#[derive(Debug, Clone)]
pub struct ShutdownSummary {
    pub metrics: MetricsSnapshot,
    pub cache_entries: usize,
    /// Workers still running when the grace period ran out.
    pub terminated: usize,
}

struct InFlight {
    job: String,
    handle: WorkerHandle,
    cancel: CancellationToken,
    started: Instant,
}

pub struct Dispatcher {
    registry: JobRegistry,
    store: Box<dyn CacheStore>,
    launcher: Box<dyn ScanLauncher>,
    metrics: Arc<Metrics>,
    config: DispatcherConfig,
    in_flight: HashMap<u64, InFlight>,
    next_launch: u64,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    /// Create a dispatcher in `Serving`. Callers bind the inputs first.
    pub fn new(
        registry: JobRegistry,
        config: DispatcherConfig,
        launcher: Box<dyn ScanLauncher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let store: Box<dyn CacheStore> = match config.max_entries {
            Some(max) => Box::new(BoundedStore::new(MemoryStore::new(), max)),
            None => Box::new(MemoryStore::new()),
        };
        let (state, _) = watch::channel(DispatcherState::Serving);

        Self {
            registry,
            store,
            launcher,
            metrics,
            config,
            in_flight: HashMap::new(),
            next_launch: 0,
            state,
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Watch state transitions from another task.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    /// Number of scans currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_running(&self, job: &str) -> bool {
        self.in_flight.values().any(|w| w.job == job)
    }

    fn set_state(&self, state: DispatcherState) {
        info!("Dispatcher state: {:?}", state);
        self.state.send_replace(state);
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    /// Fire every job due at `tick`, subject to the overlap policy.
    pub fn handle_tick(&mut self, tick: Tick) {
        self.metrics.inc_ticks();

        let due: Vec<Job> = self.registry.due(tick).cloned().collect();
        for job in due {
            if self.config.overlap == OverlapPolicy::Skip && self.is_running(&job.name) {
                self.metrics.inc_fires_skipped();
                warn!(
                    "Tick {}: job '{}' still running, skipping this fire",
                    tick, job.name
                );
                continue;
            }
            self.launch(&job);
        }

        let every = self.config.stats_every_ticks;
        if every == 0 {
            return;
        }
        let snapshot = self.metrics.snapshot();
        if snapshot.ticks % every == 0 {
            info!(
                "Stats: {} | cache {} entries, {} in flight",
                snapshot.summary(),
                self.store.len(),
                self.in_flight.len()
            );
        }
    }

    fn launch(&mut self, job: &Job) {
        let cancel = CancellationToken::new();
        let handle = self.launcher.launch(job, cancel.clone());
        let id = self.next_launch;
        self.next_launch += 1;

        self.metrics.inc_workers_launched();
        debug!("Launched scan #{} for job '{}'", id, job.name);

        self.in_flight.insert(
            id,
            InFlight {
                job: job.name.clone(),
                handle,
                cancel,
                started: Instant::now(),
            },
        );
    }

    /// Answer one lookup from the store. Never waits on workers.
    pub fn handle_lookup(&mut self, request: LookupRequest) {
        self.metrics.inc_lookups();
        let CacheQuery { msg_id, path } = request.query;

        let reply = match self.store.get(&path) {
            Some(blob) => {
                self.metrics.inc_hits();
                debug!("Lookup #{} {}: hit ({} bytes)", msg_id, path, blob.len());
                CacheReply::hit(msg_id, blob.to_vec())
            }
            None => {
                self.metrics.inc_misses();
                debug!("Lookup #{} {}: miss", msg_id, path);
                CacheReply::miss(msg_id)
            }
        };

        if request.reply.send(reply).is_err() {
            debug!("Lookup #{} abandoned by the endpoint", msg_id);
        }
    }

    /// Acknowledge first, then classify and merge.
    pub fn handle_submission(&mut self, submission: Submission) {
        if submission.ack.send(()).is_err() {
            debug!("Submission endpoint went away before the ack");
        }

        let reports = match decode_submission(&submission.payload) {
            Ok(reports) => reports,
            Err(malformed) => {
                self.metrics.inc_malformed_results();
                warn!("Discarding malformed result: {}", malformed.reason);
                return;
            }
        };

        if reports.is_empty() {
            debug!("Submission reported no jobs");
        }

        for report in reports {
            if self.registry.get(&report.job).is_none() {
                warn!("Result for unknown job '{}'", report.job);
            }

            match report.outcome {
                ScanOutcome::PreconditionFailed => {
                    self.metrics.inc_precondition_failures();
                    info!(
                        "Job '{}': root missing or not a directory, cache unchanged",
                        report.job
                    );
                }
                ScanOutcome::Matches(entries) if entries.is_empty() => {
                    self.metrics.inc_empty_results();
                    debug!("Job '{}': no matches", report.job);
                }
                ScanOutcome::Matches(entries) => {
                    let merged = self.store.merge(entries);
                    self.metrics.inc_results_merged();
                    self.metrics.add_entries_merged(merged);
                    info!(
                        "Job '{}': merged {} entries ({} cached)",
                        report.job,
                        merged,
                        self.store.len()
                    );
                }
            }
        }
    }

    /// Drop handles of finished workers and record crashes.
    pub async fn reap(&mut self) {
        let finished: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            let Some(worker) = self.in_flight.remove(&id) else {
                continue;
            };
            let elapsed = worker.started.elapsed();
            match worker.handle.await {
                Ok(Ok(())) => debug!("Scan #{} of '{}' finished in {:?}", id, worker.job, elapsed),
                Ok(Err(e)) => {
                    self.metrics.inc_worker_crashes();
                    error!("Scan #{} of '{}' failed: {:#}", id, worker.job, e);
                }
                Err(e) => {
                    self.metrics.inc_worker_crashes();
                    error!("Scan #{} of '{}' crashed: {}", id, worker.job, e);
                }
            }
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Serve until `shutdown` fires, then drain and stop.
    pub async fn run(
        mut self,
        mut inputs: DispatcherInputs,
        shutdown: CancellationToken,
    ) -> ShutdownSummary {
        info!(
            "Dispatcher serving {} jobs (overlap {:?})",
            self.registry.len(),
            self.config.overlap
        );

        loop {
            self.reap().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(tick) = inputs.ticks.recv() => self.handle_tick(tick),
                Some(request) = inputs.lookups.recv() => self.handle_lookup(request),
                Some(submission) = inputs.submissions.recv() => self.handle_submission(submission),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.shutdown(inputs).await
    }

    async fn shutdown(mut self, inputs: DispatcherInputs) -> ShutdownSummary {
        self.set_state(DispatcherState::Draining);

        let DispatcherInputs {
            ticks,
            lookups,
            mut submissions,
        } = inputs;
        // Queued lookups get their reply sender dropped; the endpoint answers with an error.
        drop(lookups);
        drop(ticks);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        info!(
            "Waiting up to {:?} for {} in-flight scans",
            self.config.shutdown_grace,
            self.in_flight.len()
        );

        loop {
            self.reap().await;
            if self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(submission) = submissions.recv() => self.handle_submission(submission),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let terminated = self.terminate_stragglers().await;

        while let Ok(submission) = submissions.try_recv() {
            self.handle_submission(submission);
        }
        drop(submissions);

        let summary = ShutdownSummary {
            metrics: self.metrics.snapshot(),
            cache_entries: self.store.len(),
            terminated,
        };
        info!("Final stats: {}", summary.metrics.summary());
        self.set_state(DispatcherState::Stopped);
        summary
    }

    async fn terminate_stragglers(&mut self) -> usize {
        let stragglers: Vec<(u64, InFlight)> = self.in_flight.drain().collect();
        for (id, worker) in &stragglers {
            warn!(
                "Terminating scan #{} of '{}' after {:?}",
                id,
                worker.job,
                worker.started.elapsed()
            );
            worker.cancel.cancel();
        }
        // Give cooperative workers a moment to kill children, then abort.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for (_, worker) in &stragglers {
            worker.handle.abort();
        }
        stragglers.len()
    }
}
