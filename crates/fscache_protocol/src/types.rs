//! Payload types and their MessagePack encodings.
//!
//! | endpoint      | request                              | response                   |
//! |---------------|--------------------------------------|----------------------------|
//! | cache-query   | `[msgid, path]`                      | `[msgid, bin \| nil]`      |
//! | worker-result | `{job_name: {path: bin} \| nil}`     | `"OK"`                     |

use std::collections::BTreeMap;
use std::io::Cursor;

use rmpv::Value;

use crate::error::{MalformedResult, ProtocolError, Result};
use crate::{Message, OpCode};

/// Fixed acknowledgment sent for every worker submission.
pub const ACK_VALUE: &str = "OK";

// ============================================================================
// Payload helpers
// ============================================================================

fn write_payload(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)?;
    Ok(buf)
}

/// Decode exactly one MessagePack value; trailing bytes are an error.
fn read_payload(bytes: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(bytes);
    let value = rmpv::decode::read_value(&mut cursor)?;
    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(ProtocolError::InvalidPayload(format!(
            "{} trailing bytes after payload",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

/// Blobs are `bin`; `str` is accepted too for peers that never distinguished.
fn blob_from_value(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Binary(bytes) => Some(bytes.clone()),
        Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Encode the fixed acknowledgment payload.
pub fn encode_ack() -> Result<Vec<u8>> {
    write_payload(&Value::from(ACK_VALUE))
}

/// True when `payload` is the fixed acknowledgment.
pub fn is_ack(payload: &[u8]) -> bool {
    matches!(read_payload(payload), Ok(value) if value.as_str() == Some(ACK_VALUE))
}

/// Build an `Err` frame describing why a request was refused.
pub fn error_message(msg_id: u64, reason: &str) -> Result<Message> {
    Message::new(OpCode::Err, msg_id, write_payload(&Value::from(reason))?)
}

/// Extract the reason from an `Err` frame, if it carries one.
pub fn error_reason(payload: &[u8]) -> Option<String> {
    read_payload(payload)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
}

// ============================================================================
// cache-query endpoint
// ============================================================================

/// Cache lookup request: `[msgid, path]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheQuery {
    pub msg_id: u64,
    pub path: String,
}

impl CacheQuery {
    pub fn new(msg_id: u64, path: impl Into<String>) -> Self {
        Self {
            msg_id,
            path: path.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        write_payload(&Value::Array(vec![
            Value::from(self.msg_id),
            Value::from(self.path.as_str()),
        ]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = read_payload(bytes)?;
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::InvalidPayload("query must be an array".into()))?;
        match items.as_slice() {
            [msg_id, path] => {
                let msg_id = msg_id.as_u64().ok_or_else(|| {
                    ProtocolError::InvalidPayload("query msgid must be an unsigned int".into())
                })?;
                let path = path.as_str().ok_or_else(|| {
                    ProtocolError::InvalidPayload("query path must be a string".into())
                })?;
                Ok(Self::new(msg_id, path))
            }
            other => Err(ProtocolError::InvalidPayload(format!(
                "query must have 2 elements, got {}",
                other.len()
            ))),
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        Message::new(OpCode::Query, self.msg_id, self.encode()?)
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        msg.expect_opcode(OpCode::Query)?;
        let query = Self::decode(&msg.payload)?;
        if query.msg_id != msg.header.msg_id {
            return Err(ProtocolError::MsgIdMismatch {
                header: msg.header.msg_id,
                payload: query.msg_id,
            });
        }
        Ok(query)
    }
}

/// Cache lookup reply: `[msgid, blob | nil]`. `None` is a cache miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReply {
    pub msg_id: u64,
    pub blob: Option<Vec<u8>>,
}

impl CacheReply {
    pub fn hit(msg_id: u64, blob: Vec<u8>) -> Self {
        Self {
            msg_id,
            blob: Some(blob),
        }
    }

    pub fn miss(msg_id: u64) -> Self {
        Self { msg_id, blob: None }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let blob = match &self.blob {
            Some(bytes) => Value::Binary(bytes.clone()),
            None => Value::Nil,
        };
        write_payload(&Value::Array(vec![Value::from(self.msg_id), blob]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = read_payload(bytes)?;
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::InvalidPayload("reply must be an array".into()))?;
        match items.as_slice() {
            [msg_id, blob] => {
                let msg_id = msg_id.as_u64().ok_or_else(|| {
                    ProtocolError::InvalidPayload("reply msgid must be an unsigned int".into())
                })?;
                if blob.is_nil() {
                    return Ok(Self::miss(msg_id));
                }
                let blob = blob_from_value(blob).ok_or_else(|| {
                    ProtocolError::InvalidPayload("reply blob must be bin, str or nil".into())
                })?;
                Ok(Self::hit(msg_id, blob))
            }
            other => Err(ProtocolError::InvalidPayload(format!(
                "reply must have 2 elements, got {}",
                other.len()
            ))),
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        Message::new(OpCode::Reply, self.msg_id, self.encode()?)
    }

    pub fn from_message(msg: &Message) -> Result<Self> {
        msg.expect_opcode(OpCode::Reply)?;
        let reply = Self::decode(&msg.payload)?;
        if reply.msg_id != msg.header.msg_id {
            return Err(ProtocolError::MsgIdMismatch {
                header: msg.header.msg_id,
                payload: reply.msg_id,
            });
        }
        Ok(reply)
    }
}

// ============================================================================
// worker-result endpoint
// ============================================================================

/// What one scan produced.
///
/// An empty `Matches` map is a successful scan that found nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Matches(BTreeMap<String, Vec<u8>>),
    /// The job's root was missing or not a directory; no walk happened.
    PreconditionFailed,
}

impl ScanOutcome {
    pub fn empty() -> Self {
        ScanOutcome::Matches(BTreeMap::new())
    }

    /// Number of cached entries this outcome carries.
    pub fn entry_count(&self) -> usize {
        match self {
            ScanOutcome::Matches(entries) => entries.len(),
            ScanOutcome::PreconditionFailed => 0,
        }
    }
}

/// One job's finished scan, as submitted to the worker-result endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub job: String,
    pub outcome: ScanOutcome,
}

impl ScanReport {
    pub fn new(job: impl Into<String>, outcome: ScanOutcome) -> Self {
        Self {
            job: job.into(),
            outcome,
        }
    }

    pub fn to_message(&self) -> Result<Message> {
        Message::new(
            OpCode::Submit,
            0,
            encode_submission(std::slice::from_ref(self))?,
        )
    }
}

/// Encode reports as `{job_name: {path: bin} | nil}`.
pub fn encode_submission(reports: &[ScanReport]) -> Result<Vec<u8>> {
    let map = reports
        .iter()
        .map(|report| {
            let value = match &report.outcome {
                ScanOutcome::Matches(entries) => Value::Map(
                    entries
                        .iter()
                        .map(|(path, blob)| (Value::from(path.as_str()), Value::Binary(blob.clone())))
                        .collect(),
                ),
                ScanOutcome::PreconditionFailed => Value::Nil,
            };
            (Value::from(report.job.as_str()), value)
        })
        .collect();
    write_payload(&Value::Map(map))
}

/// Classify a worker submission.
///
/// Accepted shapes per job: a `{path: blob}` map (possibly empty) or `nil`.
/// Anything else, including undecodable bytes, is [`MalformedResult`]; one bad
/// job entry rejects the whole submission.
pub fn decode_submission(bytes: &[u8]) -> std::result::Result<Vec<ScanReport>, MalformedResult> {
    let value = read_payload(bytes).map_err(|e| MalformedResult::new(e.to_string()))?;
    let jobs = value
        .as_map()
        .ok_or_else(|| MalformedResult::new("submission is not a map"))?;

    let mut reports = Vec::with_capacity(jobs.len());
    for (job, result) in jobs {
        let job = job
            .as_str()
            .ok_or_else(|| MalformedResult::new("job name is not a string"))?;

        if result.is_nil() {
            reports.push(ScanReport::new(job, ScanOutcome::PreconditionFailed));
            continue;
        }

        let entries = result.as_map().ok_or_else(|| {
            MalformedResult::new(format!("result for job '{}' is neither a map nor nil", job))
        })?;

        let mut matches = BTreeMap::new();
        for (path, blob) in entries {
            let path = path.as_str().ok_or_else(|| {
                MalformedResult::new(format!("job '{}' reported a non-string path", job))
            })?;
            let blob = blob_from_value(blob).ok_or_else(|| {
                MalformedResult::new(format!(
                    "job '{}' reported a non-binary blob for {}",
                    job, path
                ))
            })?;
            matches.insert(path.to_string(), blob);
        }
        reports.push(ScanReport::new(job, ScanOutcome::Matches(matches)));
    }

    Ok(reports)
}
