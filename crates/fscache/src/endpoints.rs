//! Connection layer: the two REP sockets.
//!
//! Each endpoint task owns its socket and forwards decoded requests to the
//! dispatcher over a channel, so a misbehaving peer can never stall or crash
//! the dispatcher. A REP socket must answer every request, so anything that
//! fails to unpack or decode gets an `Err` frame and counts as a protocol error.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fscache_protocol::types::{encode_ack, error_message};
use fscache_protocol::{CacheQuery, Message, OpCode, ProtocolError};
use fscache_worker::frames::{from_zmq, to_zmq};
use fscache_worker::CancellationToken;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use zeromq::{RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::dispatcher::{LookupRequest, Submission};
use crate::metrics::Metrics;

const SHUTTING_DOWN: &str = "shutting down";

/// Unlink a leftover socket file so bind does not fail with "Address in use".
pub fn remove_stale_ipc(addr: &str) {
    let Some(socket_path) = addr.strip_prefix("ipc://") else {
        return;
    };
    let path = Path::new(socket_path);
    if path.exists() {
        info!("Removing stale IPC socket: {}", socket_path);
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove stale socket {}: {}", socket_path, e);
        }
    }
}

pub async fn bind_rep(addr: &str) -> anyhow::Result<RepSocket> {
    remove_stale_ipc(addr);
    let mut socket = RepSocket::new();
    let endpoint = socket
        .bind(addr)
        .await
        .with_context(|| format!("Failed to bind REP socket to {}", addr))?;
    info!("Bound {}", endpoint);
    Ok(socket)
}

async fn reply(socket: &mut RepSocket, msg: fscache_protocol::Result<Message>) {
    let frames = match msg.and_then(|m| to_zmq(&m)) {
        Ok(frames) => frames,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            // Still answer; a REP socket left without a reply is wedged.
            match error_message(0, "internal error").and_then(|m| to_zmq(&m)) {
                Ok(frames) => frames,
                Err(_) => ZmqMessage::from(Vec::<u8>::new()),
            }
        }
    };
    if let Err(e) = socket.send(frames).await {
        warn!("Failed to send reply: {}", e);
    }
}

async fn refuse(socket: &mut RepSocket, msg_id: u64, reason: &str) {
    reply(socket, error_message(msg_id, reason)).await;
}

/// Serve `[msgid, path]` lookups until `shutdown` fires.
pub async fn serve_cache_queries(
    mut socket: RepSocket,
    lookups: mpsc::Sender<LookupRequest>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    info!("cache-query endpoint started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv() => received,
        };

        let multipart = match received {
            Ok(multipart) => multipart,
            Err(e) => {
                error!("cache-query recv error: {}", e);
                break;
            }
        };

        let msg = match from_zmq(multipart) {
            Ok(msg) => msg,
            Err(e) => {
                metrics.inc_protocol_errors();
                warn!("cache-query: bad frames: {}", e);
                refuse(&mut socket, 0, &e.to_string()).await;
                continue;
            }
        };
        let msg_id = msg.header.msg_id;

        let query = match CacheQuery::from_message(&msg) {
            Ok(query) => query,
            Err(e) => {
                metrics.inc_protocol_errors();
                warn!("cache-query: bad request #{}: {}", msg_id, e);
                refuse(&mut socket, msg_id, &e.to_string()).await;
                continue;
            }
        };

        let (tx, rx) = oneshot::channel();
        let request = LookupRequest { query, reply: tx };
        if lookups.send(request).await.is_err() {
            refuse(&mut socket, msg_id, SHUTTING_DOWN).await;
            continue;
        }

        match rx.await {
            Ok(answer) => reply(&mut socket, answer.to_message()).await,
            Err(_) => refuse(&mut socket, msg_id, SHUTTING_DOWN).await,
        }
    }

    drop(socket);
    info!("cache-query endpoint stopped");
}

/// Accept worker submissions until `shutdown` fires.
///
/// The payload is passed through undecoded; the dispatcher acknowledges and
/// then classifies it, so a malformed result is acked like any other.
pub async fn serve_worker_results(
    mut socket: RepSocket,
    submissions: mpsc::Sender<Submission>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    info!("worker-result endpoint started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv() => received,
        };

        let multipart = match received {
            Ok(multipart) => multipart,
            Err(e) => {
                error!("worker-result recv error: {}", e);
                break;
            }
        };

        let msg = match from_zmq(multipart).and_then(|msg| {
            msg.expect_opcode(OpCode::Submit)?;
            Ok::<_, ProtocolError>(msg)
        }) {
            Ok(msg) => msg,
            Err(e) => {
                metrics.inc_protocol_errors();
                warn!("worker-result: bad submission: {}", e);
                refuse(&mut socket, 0, &e.to_string()).await;
                continue;
            }
        };

        let (tx, rx) = oneshot::channel();
        let submission = Submission {
            payload: msg.payload,
            ack: tx,
        };
        if submissions.send(submission).await.is_err() {
            refuse(&mut socket, 0, SHUTTING_DOWN).await;
            continue;
        }

        match rx.await {
            Ok(()) => {
                debug!("Acknowledging submission");
                reply(
                    &mut socket,
                    encode_ack().and_then(|ack| Message::new(OpCode::Ack, 0, ack)),
                )
                .await
            }
            Err(_) => refuse(&mut socket, 0, SHUTTING_DOWN).await,
        }
    }

    drop(socket);
    info!("worker-result endpoint stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_stale_ipc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, "").unwrap();

        remove_stale_ipc(&format!("ipc://{}", path.display()));
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_stale_ipc_ignores_tcp() {
        remove_stale_ipc("tcp://127.0.0.1:5555");
    }
}
