//! Binary framing: 4-byte big-endian length prefix + MessagePack body.
//!
//! The body is encoded with named fields (maps, not tuples) so peers can add
//! fields without breaking older readers. Frames larger than the configured
//! cap fail with `FRAME_TOO_LARGE`; the transport closes the connection.

use crate::error::WireError;
use crate::message::Message;

/// Default frame cap, overridable via `MCP_MAX_FRAME_BYTES`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Width of the length prefix.
pub const LEN_PREFIX_BYTES: usize = 4;

/// Stateless encoder/decoder for MCP frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encodes the body only (no prefix). The body length is what the cap
    /// applies to; a body of exactly the cap is legal.
    pub fn encode_body(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        let body = rmp_serde::to_vec_named(msg)?;
        if body.len() > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }
        Ok(body)
    }

    /// Encodes a complete frame: length prefix + body.
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, WireError> {
        let body = self.encode_body(msg)?;
        let mut frame = Vec::with_capacity(LEN_PREFIX_BYTES + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes and validates a body (no prefix). Unknown fields are ignored;
    /// unknown enum values and schema violations fail the frame.
    pub fn decode_body(&self, body: &[u8]) -> Result<Message, WireError> {
        if body.len() > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }
        let msg: Message = rmp_serde::from_slice(body)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Reads the body length out of a prefix, enforcing the cap.
    pub fn body_len(&self, prefix: [u8; LEN_PREFIX_BYTES]) -> Result<usize, WireError> {
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(len)
    }

    /// Decodes one complete frame (prefix + body) from a contiguous buffer.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, WireError> {
        if frame.len() < LEN_PREFIX_BYTES {
            return Err(WireError::Truncated {
                have: frame.len(),
                need: LEN_PREFIX_BYTES,
            });
        }
        let mut prefix = [0u8; LEN_PREFIX_BYTES];
        prefix.copy_from_slice(&frame[..LEN_PREFIX_BYTES]);
        let len = self.body_len(prefix)?;
        let body = &frame[LEN_PREFIX_BYTES..];
        if body.len() < len {
            return Err(WireError::Truncated {
                have: body.len(),
                need: len,
            });
        }
        self.decode_body(&body[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Budget, Delivery, TaskContext};
    use crate::message::Body;
    use crate::payload::{StreamChunk, TaskRequest};

    fn sample() -> Message {
        Message::task_request(
            TaskRequest::new("echo", serde_json::json!({"text": "hi"})).with_priority(7),
        )
        .with_sender("client-1")
        .with_recipient("orchestrator")
        .with_context(
            TaskContext::new()
                .with_user("u-1")
                .with_timeout_ms(5_000)
                .with_budget(Budget::new(0.5, 10_000)),
        )
        .with_delivery(Delivery::at_least_once(2))
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = FrameCodec::default();
        let msg = sample();
        let frame = codec.encode(&msg).unwrap();
        let back = codec.decode(&frame).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn frame_prefix_is_big_endian_body_length() {
        let codec = FrameCodec::default();
        let msg = sample();
        let frame = codec.encode(&msg).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - LEN_PREFIX_BYTES);
    }

    #[test]
    fn body_at_cap_accepted_one_past_rejected() {
        let codec = FrameCodec::default();
        let body = codec.encode_body(&sample()).unwrap();

        let exact = FrameCodec::new(body.len());
        assert!(exact.decode_body(&body).is_ok());

        let small = FrameCodec::new(body.len() - 1);
        match small.decode_body(&body) {
            Err(WireError::FrameTooLarge { len, max }) => {
                assert_eq!(len, body.len());
                assert_eq!(max, body.len() - 1);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn oversize_prefix_rejected_before_body_read() {
        let codec = FrameCodec::new(1024);
        let prefix = (4096u32).to_be_bytes();
        assert!(matches!(
            codec.body_len(prefix),
            Err(WireError::FrameTooLarge { len: 4096, max: 1024 })
        ));
    }

    #[test]
    fn truncated_frame_reports_need() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&sample()).unwrap();
        assert!(matches!(
            codec.decode(&frame[..frame.len() - 1]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_fields_ignored_on_decode() {
        // Simulate a newer peer adding a field to a known payload.
        let codec = FrameCodec::default();
        let msg = Message::new(Body::StreamChunk(StreamChunk {
            sequence: 3,
            data: serde_json::json!("part"),
        }));
        let mut v = serde_json::to_value(&msg).unwrap();
        v["payload"]["compression"] = serde_json::json!("zstd");
        v["novel_envelope_field"] = serde_json::json!(true);
        let body = rmp_serde::to_vec_named(&v).unwrap();
        let back = codec.decode_body(&body).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.body, msg.body);
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let codec = FrameCodec::default();
        assert!(matches!(
            codec.decode_body(&[0xc1, 0x00, 0x17]),
            Err(WireError::Decode(_))
        ));
    }
}
