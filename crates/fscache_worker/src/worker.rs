//! Scan-then-submit lifecycle shared by in-process tasks and the worker binary.

use std::time::Instant;

use fscache_protocol::{ScanOutcome, ScanReport};
use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::scan::{run_scan, ScanError, ScanJob};
use crate::submit::{ResultSubmitter, SubmitError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("scan of job '{job}' panicked: {message}")]
    Panicked { job: String, message: String },

    #[error("scan task for job '{job}' did not finish: {message}")]
    Aborted { job: String, message: String },

    #[error("failed to submit result for job '{job}': {source}")]
    Submit {
        job: String,
        #[source]
        source: SubmitError,
    },
}

/// Run the scan on the blocking pool so a slow walk never stalls the runtime.
///
/// A panic inside the scan is contained and reported as
/// [`WorkerError::Panicked`].
pub async fn scan_blocking(
    job: ScanJob,
    cancel: CancellationToken,
) -> Result<ScanOutcome, WorkerError> {
    let name = job.name.clone();
    let handle = tokio::task::spawn_blocking(move || run_scan(&job, &cancel));

    match handle.await {
        Ok(outcome) => Ok(outcome?),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(WorkerError::Panicked { job: name, message })
        }
        Err(e) => Err(WorkerError::Aborted {
            job: name,
            message: e.to_string(),
        }),
    }
}

/// Scan once and submit the finished result exactly once.
///
/// Nothing is submitted when the scan fails; the dispatcher sees the error
/// through the worker's join handle or exit status.
pub async fn run_and_submit(
    job: ScanJob,
    result_addr: &str,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let name = job.name.clone();
    let started = Instant::now();

    let outcome = scan_blocking(job, cancel).await?;
    let entries = outcome.entry_count();
    debug!(
        "Job '{}' scanned in {:?} ({} entries)",
        name,
        started.elapsed(),
        entries
    );

    let report = ScanReport::new(name.clone(), outcome);
    let submit = async {
        let mut submitter = ResultSubmitter::connect(result_addr).await?;
        submitter.submit(&report).await
    };
    submit.await.map_err(|source| WorkerError::Submit {
        job: name.clone(),
        source,
    })?;

    info!(
        "Job '{}' submitted {} entries in {:?}",
        name,
        entries,
        started.elapsed()
    );
    Ok(())
}
