//! tokio-util codec adapter over the wire framing.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use wire::{FrameCodec, Message, LEN_PREFIX_BYTES};

use super::TransportError;

/// Frames `Message`s onto a byte stream: length prefix + MessagePack body.
#[derive(Debug, Clone, Copy)]
pub struct McpCodec {
    frames: FrameCodec,
}

impl McpCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame_bytes),
        }
    }
}

impl Decoder for McpCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if src.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX_BYTES];
        prefix.copy_from_slice(&src[..LEN_PREFIX_BYTES]);
        let body_len = self.frames.body_len(prefix)?;
        if src.len() < LEN_PREFIX_BYTES + body_len {
            src.reserve(LEN_PREFIX_BYTES + body_len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX_BYTES);
        let body = src.split_to(body_len);
        Ok(Some(self.frames.decode_body(&body)?))
    }
}

impl Encoder<Message> for McpCodec {
    type Error = TransportError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body = self.frames.encode_body(&msg)?;
        dst.reserve(LEN_PREFIX_BYTES + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
