//! Protocol error types

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid OpCode: {0}")]
    InvalidOpCode(u8),

    #[error("Header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Invalid frame count: expected {expected}, got {got}")]
    InvalidFrameCount { expected: usize, got: usize },

    #[error("Payload length mismatch: expected {expected} bytes, got {got}")]
    PayloadLengthMismatch { expected: usize, got: usize },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unexpected opcode: expected {expected:?}, got {got:?}")]
    UnexpectedOpCode {
        expected: crate::OpCode,
        got: crate::OpCode,
    },

    #[error("Message id mismatch: header says {header}, payload says {payload}")]
    MsgIdMismatch { header: u64, payload: u64 },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// A worker submission whose shape is not one of the accepted result forms.
///
/// Never sent back to the submitter; the dispatcher logs and drops it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed worker result: {reason}")]
pub struct MalformedResult {
    pub reason: String,
}

impl MalformedResult {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
