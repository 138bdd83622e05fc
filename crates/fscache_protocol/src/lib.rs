//! Binary framing for the fscache endpoints.
//!
//! Wire format shared by the cache-query and worker-result endpoints.
//!
//! # Frames
//!
//! Every message travels as two ZMQ frames: `[header, payload]`.
//!
//! Header Format: !BBHQI (16 bytes, Network Byte Order / Big Endian)
//! ```text
//! [VER:1][OP:1][RES:2][MSG_ID:8][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - MSG_ID (u64): Correlation id; mirrors the payload msgid for Query/Reply, 0 otherwise
//! - LEN (u32): Payload length in bytes
//!
//! Payloads are MessagePack values, see [`types`].

pub mod defaults;
pub mod error;
pub mod types;

pub use error::{MalformedResult, ProtocolError, Result};
pub use types::{
    decode_submission, encode_submission, CacheQuery, CacheReply, ScanOutcome, ScanReport,
    ACK_VALUE,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (4GB - 1, the max value of u32)
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Endpoint OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Client -> cache-query endpoint
    Query = 1, // "What do you hold for this path?"

    // cache-query endpoint -> Client
    Reply = 2, // "Here is the blob (or nothing)."

    // Scan worker -> worker-result endpoint
    Submit = 3, // "My scan finished. Here is everything I found."

    // worker-result endpoint -> Scan worker
    Ack = 4, // "Got it, you may exit."

    // Endpoint -> peer
    Err = 5, // "Could not make sense of that request."
}

impl OpCode {
    /// Convert u8 to OpCode
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Unknown),
            1 => Ok(OpCode::Query),
            2 => Ok(OpCode::Reply),
            3 => Ok(OpCode::Submit),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Err),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    /// Convert OpCode to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub msg_id: u64,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, msg_id: u64, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            msg_id,
            payload_len,
        }
    }

    /// Pack header into a 16-byte buffer (big endian).
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.msg_id)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from a 16-byte buffer.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let msg_id = cursor.read_u64::<BigEndian>()?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            msg_id,
            payload_len,
        })
    }
}

/// Protocol message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Returns an error if payload exceeds MAX_PAYLOAD_SIZE.
    pub fn new(opcode: OpCode, msg_id: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, msg_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Pack message into ZMQ frames (header, payload)
    pub fn pack(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let header_bytes = self.header.pack()?.to_vec();
        Ok((header_bytes, self.payload.clone()))
    }

    /// Unpack message from ZMQ frames
    pub fn unpack(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() != 2 {
            return Err(ProtocolError::InvalidFrameCount {
                expected: 2,
                got: frames.len(),
            });
        }

        let header = Header::unpack(&frames[0])?;
        let payload = frames[1].clone();

        if payload.len() != header.payload_len as usize {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected: header.payload_len as usize,
                got: payload.len(),
            });
        }

        Ok(Self { header, payload })
    }

    /// Fail unless this message carries `expected`.
    pub fn expect_opcode(&self, expected: OpCode) -> Result<()> {
        if self.header.opcode != expected {
            return Err(ProtocolError::UnexpectedOpCode {
                expected,
                got: self.header.opcode,
            });
        }
        Ok(())
    }
}
