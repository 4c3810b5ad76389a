//! Frame codec for the datagram wire protocol.
//!
//! Event datagram (host → subscriber), the 2-frame message in one datagram:
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────┐
//! │ topic len(4B)│ topic utf-8 │   envelope JSON      │
//! │ u32 BE       │             │                      │
//! └──────────────┴─────────────┴──────────────────────┘
//! ```
//!
//! Subscription control datagram (subscriber → host), one byte of opcode
//! followed by the topic prefix:
//! ```text
//! ┌──────────┬────────────────┐
//! │ op (1B)  │  prefix utf-8  │
//! └──────────┴────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Error, Result};

/// Control opcode: drop a topic-prefix subscription.
pub const CTRL_UNSUBSCRIBE: u8 = 0x00;
/// Control opcode: add a topic-prefix subscription.
pub const CTRL_SUBSCRIBE: u8 = 0x01;

/// Encode a 2-frame event message into one datagram.
pub fn encode_event(topic: &str, envelope_json: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + topic.len() + envelope_json.len());
    buf.put_u32(topic.len() as u32);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(envelope_json);
    buf.freeze()
}

/// Decode an event datagram into `(topic, envelope JSON bytes)`.
pub fn decode_event(frame: &[u8]) -> Result<(String, Vec<u8>)> {
    if frame.len() < 4 {
        return Err(Error::validation("event frame shorter than topic length prefix"));
    }
    let topic_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() < 4 + topic_len {
        return Err(Error::validation(format!(
            "event frame truncated: declared topic of {} bytes, {} available",
            topic_len,
            frame.len() - 4
        )));
    }
    let topic = std::str::from_utf8(&frame[4..4 + topic_len])
        .map_err(|_| Error::validation("event topic is not valid utf-8"))?
        .to_string();
    Ok((topic, frame[4 + topic_len..].to_vec()))
}

/// Encode a subscription control frame.
pub fn encode_control(subscribe: bool, prefix: &str) -> Vec<u8> {
    let op = if subscribe { CTRL_SUBSCRIBE } else { CTRL_UNSUBSCRIBE };
    let mut buf = Vec::with_capacity(1 + prefix.len());
    buf.push(op);
    buf.extend_from_slice(prefix.as_bytes());
    buf
}

/// Decode a subscription control frame into `(subscribe, prefix)`.
/// Returns `None` for frames that are not well-formed control messages.
pub fn decode_control(frame: &[u8]) -> Option<(bool, String)> {
    let (&op, prefix) = frame.split_first()?;
    if op != CTRL_SUBSCRIBE && op != CTRL_UNSUBSCRIBE {
        return None;
    }
    let prefix = std::str::from_utf8(prefix).ok()?;
    Some((op == CTRL_SUBSCRIBE, prefix.to_string()))
}
