//! Gateway frame encoding and decoding.
//!
//! Every frame on the wire is a JSON envelope:
//!
//! ```json
//! {"op": 0, "s": 42, "e": "MESSAGE_CREATE", "d": {"content": "hi"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::DecodeError;
use crate::model::Hello;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
    Close = 12,
}

impl Opcode {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            12 => Opcode::Close,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One decoded gateway message. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: Opcode,
    pub seq: Option<u64>,
    pub event: Option<String>,
    pub data: Value,
}

#[derive(Serialize, Deserialize)]
struct RawFrame {
    op: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    e: Option<String>,
    #[serde(default)]
    d: Value,
}

impl Frame {
    pub fn new(op: Opcode, data: Value) -> Self {
        Self { op, seq: None, event: None, data }
    }

    pub fn dispatch(seq: u64, event: impl Into<String>, data: Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            seq: Some(seq),
            event: Some(event.into()),
            data,
        }
    }

    pub fn identify(token: &str) -> Self {
        Self::new(Opcode::Identify, json!({ "token": token }))
    }

    pub fn resume(token: &str, session_id: &str, resume_token: &str, seq: Option<u64>) -> Self {
        Self::new(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "resume_token": resume_token,
                "seq": seq,
            }),
        )
    }

    /// Heartbeats carry the last sequence number seen, or null.
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, json!(seq))
    }

    pub fn hello(interval: Duration) -> Self {
        Self::new(Opcode::Hello, json!({ "hbt_int": interval.as_millis() as u64 }))
    }

    /// Interval announced by a Hello frame. Hiven calls it `hbt_int`.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if self.op != Opcode::Hello {
            return None;
        }
        let hello: Hello = serde_json::from_value(self.data.clone()).ok()?;
        hello.interval_ms().map(Duration::from_millis)
    }
}

/// Decodes one frame.
///
/// Frames with an opcode this client does not know are logged and dropped
/// (`Ok(None)`) rather than raised.
pub fn decode(bytes: &[u8]) -> Result<Option<Frame>, DecodeError> {
    let raw: RawFrame = serde_json::from_slice(bytes)?;

    let Some(op) = Opcode::from_code(raw.op) else {
        log::warn!("Dropping frame with unknown opcode {}", raw.op);
        return Ok(None);
    };

    if op == Opcode::Dispatch && raw.e.as_deref().map_or(true, str::is_empty) {
        return Err(DecodeError::MissingEventName);
    }

    Ok(Some(Frame {
        op,
        seq: raw.s,
        event: raw.e,
        data: raw.d,
    }))
}

pub fn decode_text(text: &str) -> Result<Option<Frame>, DecodeError> {
    decode(text.as_bytes())
}

pub fn encode(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RawFrame {
        op: u64::from(frame.op.code()),
        s: frame.seq,
        e: frame.event.clone(),
        d: frame.data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_dispatch_envelope() {
        let frame = decode_text(r#"{"op":0,"s":7,"e":"MESSAGE_CREATE","d":{"content":"hi"}}"#)
            .unwrap()
            .unwrap();

        assert_eq!(frame.op, Opcode::Dispatch);
        assert_eq!(frame.seq, Some(7));
        assert_eq!(frame.event.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(frame.data["content"], "hi");
    }

    #[test]
    fn unknown_opcode_is_dropped_not_raised() {
        assert!(decode_text(r#"{"op":42,"d":null}"#).unwrap().is_none());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(matches!(decode_text("{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode_text(r#"{"d":{}}"#), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn dispatch_needs_event_name() {
        assert!(matches!(
            decode_text(r#"{"op":0,"s":1,"d":{}}"#),
            Err(DecodeError::MissingEventName)
        ));
    }

    #[test]
    fn hello_interval_accepts_both_spellings() {
        let hiven = decode_text(r#"{"op":10,"d":{"hbt_int":30000}}"#).unwrap().unwrap();
        assert_eq!(hiven.heartbeat_interval(), Some(Duration::from_secs(30)));

        let other = decode_text(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(other.heartbeat_interval(), Some(Duration::from_millis(41_250)));

        let zero = decode_text(r#"{"op":10,"d":{"hbt_int":0}}"#).unwrap().unwrap();
        assert_eq!(zero.heartbeat_interval(), None);
    }

    #[test]
    fn encoded_identify_omits_empty_fields() {
        let text = encode(&Frame::identify("secret")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value, json!({ "op": 2, "d": { "token": "secret" } }));
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        let text = encode(&Frame::heartbeat(Some(12))).unwrap();
        let frame = decode_text(&text).unwrap().unwrap();
        assert_eq!(frame.op, Opcode::Heartbeat);
        assert_eq!(frame.data, json!(12));
    }
}
