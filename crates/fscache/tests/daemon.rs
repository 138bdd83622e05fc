//! End-to-end tests against a running daemon over ipc sockets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fscache::launcher::WorkerHandle;
use fscache::{
    server, CacheClient, DispatcherConfig, DispatcherState, Isolation, Job, JobRegistry, JobSpec,
    ScanLauncher, ServerHandle,
};
use fscache_protocol::types::{error_reason, is_ack};
use fscache_protocol::{CacheQuery, Message, OpCode, ScanOutcome, ScanReport};
use fscache_worker::frames::{from_zmq, to_zmq};
use fscache_worker::{CancellationToken, ResultSubmitter};
use rmpv::Value;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend};

struct Sockets {
    _dir: tempfile::TempDir,
    cache: String,
    result: String,
}

fn sockets() -> Sockets {
    let dir = tempfile::tempdir().unwrap();
    let cache = format!("ipc://{}", dir.path().join("cache.sock").display());
    let result = format!("ipc://{}", dir.path().join("upd.sock").display());
    Sockets {
        _dir: dir,
        cache,
        result,
    }
}

fn fast_config(sockets: &Sockets) -> DispatcherConfig {
    DispatcherConfig {
        cache_addr: sockets.cache.clone(),
        result_addr: sockets.result.clone(),
        tick_period: Duration::from_millis(10),
        poll_interval: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(2),
        stats_every_ticks: 0,
        ..Default::default()
    }
}

fn registry(specs: Vec<JobSpec>) -> JobRegistry {
    let mut builder = JobRegistry::builder();
    for spec in specs {
        builder = builder.add(spec).unwrap();
    }
    builder.build()
}

fn key(root: &Path, rel: &str) -> String {
    root.join(rel).to_string_lossy().into_owned()
}

/// Poll `check` until it holds or `timeout` passes.
async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn stop(handle: ServerHandle) -> fscache::ShutdownSummary {
    tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap()
}

async fn raw_request(addr: &str, frames: zeromq::ZmqMessage) -> Message {
    let mut socket = ReqSocket::new();
    socket.connect(addr).await.unwrap();
    socket.send(frames).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), socket.recv())
        .await
        .unwrap()
        .unwrap();
    from_zmq(reply).unwrap()
}

#[tokio::test]
async fn test_grains_job_end_to_end() {
    let tree = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tree.path().join("a")).unwrap();
    std::fs::create_dir_all(tree.path().join("b")).unwrap();
    std::fs::write(tree.path().join("a/data.p"), "X").unwrap();
    std::fs::write(tree.path().join("b/skip.txt"), "Y").unwrap();

    let sockets = sockets();
    let jobs = registry(vec![JobSpec::new(
        "grains",
        tree.path(),
        r".*/data\.p$",
        [2, 12, 22],
    )]);
    let handle = server::start(jobs, fast_config(&sockets)).await.unwrap();
    assert_eq!(handle.state(), DispatcherState::Serving);

    let mut client = CacheClient::connect(&sockets.cache).await.unwrap();
    let wanted = key(tree.path(), "a/data.p");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let blob = loop {
        if let Ok(Some(blob)) = client.get(&wanted).await {
            break blob;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "grains result never reached the cache"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(blob, b"X".to_vec());

    assert_eq!(client.get(&key(tree.path(), "b/skip.txt")).await.unwrap(), None);

    let snapshot = handle.metrics().snapshot();
    assert!(snapshot.workers_launched >= 1);
    assert!(snapshot.results_merged >= 1);

    let summary = stop(handle).await;
    assert_eq!(summary.cache_entries, 1);
}

/// The `fscache-worker` binary built next to this test's target directory.
fn built_worker_exe() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    // target/<profile>/deps/<test> -> target/<profile>/fscache-worker
    let profile_dir = exe.parent()?.parent()?;
    let worker = profile_dir.join(format!("fscache-worker{}", std::env::consts::EXE_SUFFIX));
    worker.is_file().then_some(worker)
}

#[tokio::test]
async fn test_grains_job_end_to_end_in_worker_process() {
    let Some(worker_exe) = built_worker_exe() else {
        eprintln!("fscache-worker not built; run the workspace tests to cover process isolation");
        return;
    };

    let tree = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tree.path().join("a")).unwrap();
    std::fs::create_dir_all(tree.path().join("b")).unwrap();
    std::fs::write(tree.path().join("a/data.p"), "X").unwrap();
    std::fs::write(tree.path().join("b/skip.txt"), "Y").unwrap();

    let sockets = sockets();
    let config = DispatcherConfig {
        isolation: Isolation::Process { worker_exe },
        ..fast_config(&sockets)
    };
    let jobs = registry(vec![JobSpec::new(
        "grains",
        tree.path(),
        r".*/data\.p$",
        [2, 12, 22],
    )]);
    let handle = server::start(jobs, config).await.unwrap();

    let mut client = CacheClient::connect(&sockets.cache).await.unwrap();
    let wanted = key(tree.path(), "a/data.p");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    let blob = loop {
        if let Ok(Some(blob)) = client.get(&wanted).await {
            break blob;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker process result never reached the cache"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(blob, b"X".to_vec());
    assert_eq!(client.get(&key(tree.path(), "b/skip.txt")).await.unwrap(), None);

    let summary = stop(handle).await;
    assert_eq!(summary.metrics.worker_crashes, 0);
    assert_eq!(summary.cache_entries, 1);
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_answers() {
    let sockets = sockets();
    let handle = server::start(registry(vec![]), fast_config(&sockets)).await.unwrap();

    let entries: BTreeMap<String, Vec<u8>> = (0..40)
        .map(|i| (format!("/p/{}", i), format!("v{}", i).into_bytes()))
        .collect();
    let mut submitter = ResultSubmitter::connect(&sockets.result).await.unwrap();
    submitter
        .submit(&ScanReport::new("seed", ScanOutcome::Matches(entries)))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for worker in 0..6u64 {
        let addr = sockets.cache.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = CacheClient::connect(&addr)
                .await
                .unwrap()
                .with_timeout(Duration::from_secs(2));
            for round in 0..40u64 {
                let i = (round * 7 + worker * 3) % 40;
                let blob = client.get(&format!("/p/{}", i)).await.unwrap();
                assert_eq!(blob, Some(format!("v{}", i).into_bytes()));
            }
            assert_eq!(client.get("/p/missing").await.unwrap(), None);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = handle.metrics().snapshot();
    assert_eq!(snapshot.hits, 240);
    assert_eq!(snapshot.misses, 6);
    stop(handle).await;
}

#[tokio::test]
async fn test_reply_mirrors_request_msgid() {
    let sockets = sockets();
    let handle = server::start(registry(vec![]), fast_config(&sockets)).await.unwrap();

    let query = CacheQuery::new(0xDEAD_BEEF, "/nowhere").to_message().unwrap();
    let reply = raw_request(&sockets.cache, to_zmq(&query).unwrap()).await;
    assert_eq!(reply.opcode(), OpCode::Reply);
    assert_eq!(reply.header.msg_id, 0xDEAD_BEEF);

    stop(handle).await;
}

#[tokio::test]
async fn test_bad_query_frames_get_error_reply() {
    let sockets = sockets();
    let handle = server::start(registry(vec![]), fast_config(&sockets)).await.unwrap();

    // Header msgid disagrees with payload msgid
    let payload = CacheQuery::new(7, "a.txt").encode().unwrap();
    let mismatched = Message::new(OpCode::Query, 8, payload).unwrap();
    let reply = raw_request(&sockets.cache, to_zmq(&mismatched).unwrap()).await;
    assert_eq!(reply.opcode(), OpCode::Err);

    // A single frame cannot be unpacked
    let reply = raw_request(&sockets.cache, zeromq::ZmqMessage::from(vec![1u8, 2, 3])).await;
    assert_eq!(reply.opcode(), OpCode::Err);
    assert!(error_reason(&reply.payload).is_some());

    assert_eq!(handle.metrics().snapshot().protocol_errors, 2);

    // The endpoint keeps serving
    let mut client = CacheClient::connect(&sockets.cache).await.unwrap();
    assert_eq!(client.get("a.txt").await.unwrap(), None);

    stop(handle).await;
}

#[tokio::test]
async fn test_malformed_submission_is_acked_and_ignored() {
    let sockets = sockets();
    let handle = server::start(registry(vec![]), fast_config(&sockets)).await.unwrap();

    let mut payload = Vec::new();
    rmpv::encode::write_value(
        &mut payload,
        &Value::Map(vec![(Value::from("grains"), Value::from(42u64))]),
    )
    .unwrap();
    let submit = Message::new(OpCode::Submit, 0, payload).unwrap();
    let reply = raw_request(&sockets.result, to_zmq(&submit).unwrap()).await;

    assert_eq!(reply.opcode(), OpCode::Ack);
    assert!(is_ack(&reply.payload));

    let metrics = handle.metrics();
    assert!(
        eventually(Duration::from_secs(2), || {
            let metrics = metrics.clone();
            async move { metrics.snapshot().malformed_results == 1 }
        })
        .await
    );

    let summary = stop(handle).await;
    assert_eq!(summary.cache_entries, 0);
}

#[tokio::test]
async fn test_missing_root_reports_precondition_over_the_wire() {
    let tree = tempfile::tempdir().unwrap();
    let sockets = sockets();
    let jobs = registry(vec![JobSpec::new(
        "grains",
        tree.path().join("does-not-exist"),
        ".*",
        [0],
    )]);
    let handle = server::start(jobs, fast_config(&sockets)).await.unwrap();

    let metrics = handle.metrics();
    assert!(
        eventually(Duration::from_secs(5), || {
            let metrics = metrics.clone();
            async move { metrics.snapshot().precondition_failures >= 1 }
        })
        .await
    );

    let summary = stop(handle).await;
    assert_eq!(summary.cache_entries, 0);
    assert_eq!(summary.metrics.results_merged, 0);
}

/// Workers that never finish on their own.
struct HangingLauncher;

impl ScanLauncher for HangingLauncher {
    fn launch(&self, _job: &Job, cancel: CancellationToken) -> WorkerHandle {
        tokio::spawn(async move {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        })
    }
}

#[tokio::test]
async fn test_shutdown_terminates_stragglers_and_stops() {
    let sockets = sockets();
    let config = DispatcherConfig {
        shutdown_grace: Duration::from_millis(100),
        ..fast_config(&sockets)
    };
    let jobs = registry(vec![JobSpec::new("slow", "/tmp", ".*", [0])]);
    let mut handle = server::start_with_launcher(jobs, config, Box::new(HangingLauncher))
        .await
        .unwrap();

    let metrics = handle.metrics();
    assert!(
        eventually(Duration::from_secs(2), || {
            let metrics = metrics.clone();
            async move { metrics.snapshot().workers_launched >= 1 }
        })
        .await
    );
    assert!(!handle.wait_for_state(DispatcherState::Stopped, Duration::from_millis(20)).await);

    let summary = stop(handle).await;
    assert_eq!(summary.terminated, 1);
}

#[tokio::test]
async fn test_stale_ipc_socket_file_does_not_block_bind() {
    let sockets = sockets();
    let stale = sockets.cache.strip_prefix("ipc://").unwrap().to_string();
    std::fs::write(&stale, "").unwrap();

    let handle = server::start(registry(vec![]), fast_config(&sockets)).await.unwrap();
    let mut client = CacheClient::connect(&sockets.cache).await.unwrap();
    assert_eq!(client.get("anything").await.unwrap(), None);
    stop(handle).await;
}
