//! Wire frames of the `openOutputSlot` stream.
//!
//! Every frame is a one-byte tag, a big-endian `u32` payload length and the
//! payload. A stream is a run of [`SlotFrame::Chunk`] frames terminated by
//! either [`SlotFrame::Eos`] or [`SlotFrame::Error`].

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 5;

/// Default upper bound of a single frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const TAG_CHUNK: u8 = 0;
const TAG_EOS: u8 = 1;
const TAG_ERROR: u8 = 2;

/// One frame of a slot byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotFrame {
    /// Payload bytes.
    Chunk(Bytes),
    /// End of stream marker. Never delivered to callers as payload.
    Eos,
    /// Producer-side failure; terminates the stream.
    Error(String),
}

impl SlotFrame {
    fn tag(&self) -> u8 {
        match self {
            Self::Chunk(_) => TAG_CHUNK,
            Self::Eos => TAG_EOS,
            Self::Error(_) => TAG_ERROR,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Chunk(bytes) => bytes,
            Self::Eos => &[],
            Self::Error(message) => message.as_bytes(),
        }
    }

    /// Appends the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let payload = self.payload();
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(self.tag());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
    }

    /// Returns the encoded frame.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode_into(&mut dst);
        dst.freeze()
    }
}

/// Length-prefixed codec for [`SlotFrame`].
#[derive(Debug, Clone, Copy)]
pub struct SlotFrameCodec {
    max_frame_len: usize,
}

impl SlotFrameCodec {
    /// Creates a codec with the default frame size limit.
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the maximum accepted payload length.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Default for SlotFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SlotFrameCodec {
    type Item = SlotFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit of {}", self.max_frame_len),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let frame = match tag {
            TAG_CHUNK => SlotFrame::Chunk(payload),
            TAG_EOS => SlotFrame::Eos,
            TAG_ERROR => SlotFrame::Error(String::from_utf8_lossy(&payload).into_owned()),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame tag {other}"),
                ));
            }
        };

        Ok(Some(frame))
    }
}

impl Encoder<SlotFrame> for SlotFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: SlotFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload().len() > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds limit",
            ));
        }
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_across_reads() -> io::Result<()> {
        let mut codec = SlotFrameCodec::new();
        let mut wire = BytesMut::new();
        SlotFrame::Chunk(Bytes::from_static(b"hello\n")).encode_into(&mut wire);
        SlotFrame::Eos.encode_into(&mut wire);

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&wire[..3]);
        assert_eq!(codec.decode(&mut buffer)?, None);

        buffer.extend_from_slice(&wire[3..]);
        assert_eq!(
            codec.decode(&mut buffer)?,
            Some(SlotFrame::Chunk(Bytes::from_static(b"hello\n")))
        );
        assert_eq!(codec.decode(&mut buffer)?, Some(SlotFrame::Eos));
        assert_eq!(codec.decode(&mut buffer)?, None);
        Ok(())
    }

    #[test]
    fn carries_error_messages() -> io::Result<()> {
        let mut codec = SlotFrameCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(SlotFrame::Error("disk full".into()), &mut buffer)?;
        assert_eq!(
            codec.decode(&mut buffer)?,
            Some(SlotFrame::Error("disk full".into()))
        );
        Ok(())
    }

    #[test]
    fn rejects_oversized_and_unknown_frames() {
        let mut codec = SlotFrameCodec::new().with_max_frame_len(4);
        let mut buffer = BytesMut::new();
        SlotFrame::Chunk(Bytes::from_static(b"too long")).encode_into(&mut buffer);
        assert!(codec.decode(&mut buffer).is_err());

        let mut unknown = BytesMut::from(&[9u8, 0, 0, 0, 0][..]);
        assert!(SlotFrameCodec::new().decode(&mut unknown).is_err());
    }
}
