//! Length-prefixed frame codec for the RPC transport.
//!
//! Each frame is a 4-byte big-endian length followed by the payload:
//!
//! ```text
//! +----------------------+------------------+
//! | Length (4 bytes, BE) | Payload          |
//! +----------------------+------------------+
//! ```
//!
//! The length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation, so a hostile prefix cannot exhaust memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::Error;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Length-prefixed binary framing for use with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "frame of {length} bytes exceeds cap of {MAX_FRAME_SIZE}"
            )));
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds cap of {MAX_FRAME_SIZE}",
                item.len()
            )));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
