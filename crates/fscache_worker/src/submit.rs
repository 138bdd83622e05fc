//! REQ-side client of the worker-result endpoint.

use std::time::Duration;

use fscache_protocol::types::{error_reason, is_ack};
use fscache_protocol::{OpCode, ProtocolError, ScanReport};
use thiserror::Error;
use tracing::debug;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqError};

use crate::frames::{from_zmq, to_zmq};

/// How long to wait for the acknowledgment before giving up.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("ZMQ error: {0}")]
    Zmq(#[from] ZmqError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("submission refused: {0}")]
    Refused(String),

    #[error("unexpected acknowledgment payload")]
    BadAck,
}

/// Connected submitter. One report per request, strict ping-pong.
pub struct ResultSubmitter {
    socket: ReqSocket,
    addr: String,
    ack_timeout: Duration,
}

impl ResultSubmitter {
    pub async fn connect(addr: &str) -> Result<Self, SubmitError> {
        let mut socket = ReqSocket::new();
        socket.connect(addr).await?;
        debug!("Connected to worker-result endpoint {}", addr);
        Ok(Self {
            socket,
            addr: addr.to_string(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        })
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one report and wait for the fixed acknowledgment.
    pub async fn submit(&mut self, report: &ScanReport) -> Result<(), SubmitError> {
        let msg = report.to_message()?;
        self.socket.send(to_zmq(&msg)?).await?;

        let reply = tokio::time::timeout(self.ack_timeout, self.socket.recv())
            .await
            .map_err(|_| SubmitError::Timeout(self.ack_timeout))??;
        let reply = from_zmq(reply)?;

        match reply.opcode() {
            OpCode::Ack if is_ack(&reply.payload) => Ok(()),
            OpCode::Ack => Err(SubmitError::BadAck),
            OpCode::Err => Err(SubmitError::Refused(
                error_reason(&reply.payload).unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(ProtocolError::UnexpectedOpCode {
                expected: OpCode::Ack,
                got: other,
            }
            .into()),
        }
    }
}
