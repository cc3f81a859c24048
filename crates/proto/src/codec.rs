use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::msg;

/// A single protocol frame: `type:u32 | length:u32 | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ftype: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(ftype: u32, data: impl Into<Bytes>) -> Self {
        Self {
            ftype,
            data: data.into(),
        }
    }

    /// An empty frame of the given type (NOP, ERROR_OCCURRED, ...).
    pub fn empty(ftype: u32) -> Self {
        Self {
            ftype,
            data: Bytes::new(),
        }
    }

    pub fn is_nop(&self) -> bool {
        self.ftype == msg::ANTOAN_NOP && self.data.is_empty()
    }

    /// Serializes the frame into a standalone byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.put_u32(self.ftype);
        out.put_u32(self.data.len() as u32);
        out.extend_from_slice(&self.data);
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too long ({length}/{limit}) ; command:{ftype}")]
    TooLong { ftype: u32, length: u32, limit: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Framing codec for the `type | length | payload` protocol.
///
/// The decoder rejects frames whose declared length exceeds the configured
/// bound; the peer is considered out of sync at that point and the connection
/// should be dropped.
#[derive(Debug)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }

    /// Codec for the master link.
    pub fn master() -> Self {
        Self::new(crate::MASTER_MAX_PACKET_SIZE)
    }

    /// Codec for the client data path.
    pub fn data() -> Self {
        Self::new(crate::DATA_MAX_PACKET_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 8 {
            return Ok(None);
        }
        let mut hdr = &src[..8];
        let ftype = hdr.get_u32();
        let length = hdr.get_u32();
        if length > self.max_payload {
            return Err(FrameError::TooLong {
                ftype,
                length,
                limit: self.max_payload,
            });
        }
        let total = 8 + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(8);
        let data = src.split_to(length as usize).freeze();
        Ok(Some(Frame { ftype, data }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(8 + frame.data.len());
        dst.put_u32(frame.ftype);
        dst.put_u32(frame.data.len() as u32);
        dst.extend_from_slice(&frame.data);
        Ok(())
    }
}
