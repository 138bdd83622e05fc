//! Cache Client
//!
//! Async REQ client for the cache-query endpoint. One request in flight at a
//! time (`&mut self`), every reply checked against the request's msgid.
//! After a timeout or a mismatched reply the socket is rebuilt, so a late
//! reply can never be taken for the answer to a later request.

use std::time::Duration;

use fscache_protocol::defaults::DEFAULT_QUERY_TIMEOUT_MS;
use fscache_protocol::types::error_reason;
use fscache_protocol::{CacheQuery, CacheReply, OpCode, ProtocolError};
use fscache_worker::frames::{from_zmq, to_zmq};
use thiserror::Error;
use tracing::debug;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("ZMQ error: {0}")]
    Zmq(#[from] ZmqError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("reply for msgid {got} does not answer request {expected}")]
    MsgIdMismatch { expected: u64, got: u64 },

    #[error("server refused request: {0}")]
    Refused(String),
}

pub struct CacheClient {
    addr: String,
    socket: Option<ReqSocket>,
    next_msg_id: u64,
    timeout: Duration,
}

impl CacheClient {
    /// Connect to the cache-query endpoint at the given address
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let mut client = Self {
            addr: addr.to_string(),
            socket: None,
            next_msg_id: 1,
            timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
        };
        client.socket = Some(client.open().await?);
        Ok(client)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open(&self) -> Result<ReqSocket, ClientError> {
        let mut socket = ReqSocket::new();
        socket.connect(&self.addr).await?;
        debug!("Connected to cache-query endpoint {}", self.addr);
        Ok(socket)
    }

    /// Look up one path. `Ok(None)` is a cache miss.
    pub async fn get(&mut self, path: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);

        // Take the socket; it is only put back after a clean exchange.
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.open().await?,
        };

        let request = CacheQuery::new(msg_id, path).to_message()?;
        socket.send(to_zmq(&request)?).await?;

        let received = match tokio::time::timeout(self.timeout, socket.recv()).await {
            Ok(received) => received?,
            Err(_) => {
                debug!("Query #{} timed out, dropping socket", msg_id);
                return Err(ClientError::Timeout(self.timeout));
            }
        };
        let msg = from_zmq(received)?;

        if msg.opcode() == OpCode::Err {
            self.socket = Some(socket);
            return Err(ClientError::Refused(
                error_reason(&msg.payload).unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        let reply = CacheReply::from_message(&msg)?;
        if reply.msg_id != msg_id {
            return Err(ClientError::MsgIdMismatch {
                expected: msg_id,
                got: reply.msg_id,
            });
        }

        self.socket = Some(socket);
        Ok(reply.blob)
    }
}
