//! Conversion between protocol messages and ZMQ multipart messages.

use fscache_protocol::{Message, Result};
use zeromq::ZmqMessage;

/// Pack a protocol message as `[header, payload]`.
pub fn to_zmq(msg: &Message) -> Result<ZmqMessage> {
    let (header, body) = msg.pack()?;
    let mut multipart = ZmqMessage::from(header);
    multipart.push_back(body.into());
    Ok(multipart)
}

/// Unpack a received multipart message; exactly two frames are accepted.
pub fn from_zmq(multipart: ZmqMessage) -> Result<Message> {
    let parts: Vec<Vec<u8>> = multipart
        .into_vec()
        .into_iter()
        .map(|b| b.to_vec())
        .collect();
    Message::unpack(&parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fscache_protocol::{CacheQuery, OpCode, ProtocolError};

    #[test]
    fn test_frames_survive_conversion() {
        let msg = CacheQuery::new(11, "/tmp/x").to_message().unwrap();
        let back = from_zmq(to_zmq(&msg).unwrap()).unwrap();
        assert_eq!(back.opcode(), OpCode::Query);
        assert_eq!(back.header.msg_id, 11);
        assert_eq!(back.payload, msg.payload);
    }

    #[test]
    fn test_single_frame_rejected() {
        let multipart = ZmqMessage::from(vec![1u8, 2, 3]);
        assert!(matches!(
            from_zmq(multipart),
            Err(ProtocolError::InvalidFrameCount { got: 1, .. })
        ));
    }
}
