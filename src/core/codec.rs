//! Frame codec for the peer link wire format.
//!
//! ```text
//! [Flags(1)] [Length(3, big-endian)] [Payload(N)]
//! ```
//!
//! Bit 0 of the flags byte marks a payload encrypted as a whole with the
//! network key. The payload is an encoded [`Message`](crate::core::message::Message).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 4;

/// Largest payload a 24-bit length can describe
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Flag bit marking an encrypted payload
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// One unit of wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, encrypted: bool) -> Self {
        Self {
            flags: if encrypted { FLAG_ENCRYPTED } else { 0 },
            payload: payload.into(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// Serialize header and payload into a single contiguous buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        FrameCodec::default().encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Build the 4-byte header for a payload of `length` bytes
pub fn encode_header(flags: u8, length: usize) -> Result<[u8; HEADER_SIZE]> {
    if length > MAX_FRAME_LENGTH {
        return Err(ProtocolError::OversizedFrame(length));
    }
    let len = (length as u32).to_be_bytes();
    Ok([flags, len[1], len[2], len[3]])
}

/// Parse a 4-byte header into `(flags, length)`
pub fn decode_header(header: &[u8]) -> Result<(u8, usize)> {
    if header.len() < HEADER_SIZE {
        return Err(ProtocolError::InvalidFrame(format!(
            "header needs {HEADER_SIZE} bytes, got {}",
            header.len()
        )));
    }
    let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    Ok((header[0], length))
}

/// Tokio codec reassembling frames from an arbitrary split of the byte stream
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    /// Codec rejecting frames longer than `max_length` (clamped to the 24-bit limit)
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.min(MAX_FRAME_LENGTH),
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_length: MAX_FRAME_LENGTH,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (flags, length) = decode_header(&src[..HEADER_SIZE])?;
        if length > self.max_length {
            return Err(ProtocolError::OversizedFrame(length));
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { flags, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_length {
            return Err(ProtocolError::OversizedFrame(frame.payload.len()));
        }
        let header = encode_header(frame.flags, frame.payload.len())?;
        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
