use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{RuncoreError, RuncoreResult};

/// Single-byte magic identifying a well-formed frame on the wire (§6).
pub const FRAME_MAGIC: u8 = b'W';

/// Frames larger than this are rejected before the length-prefixed body is
/// even buffered, bounding memory use against a corrupt or hostile peer
/// (§6, §7).
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024 * 1024;

const HEADER_LEN: usize = 1 + 4;

/// `tokio_util` codec for the wire protocol: 1-byte magic, 4-byte
/// little-endian length, then a JSON-encoded payload (§6). Generic over the
/// payload type so the same codec serves `ServerRequest` on the read side
/// of a connection and `ServerResponse` on the write side. Mirrors the
/// length-prefix-plus-magic shape of the transaction log header so both
/// layers can be parsed with the same mental model.
pub struct FrameCodec<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = RuncoreError;

    fn decode(&mut self, src: &mut BytesMut) -> RuncoreResult<Option<T>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = src[0];
        if magic != FRAME_MAGIC {
            return Err(RuncoreError::BadMagic {
                expected: FRAME_MAGIC,
                actual: magic,
            });
        }
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RuncoreError::FrameTooLarge {
                size: len as u64,
                max: MAX_FRAME_LEN as u64,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let value: T = serde_json::from_slice(&payload)?;
        Ok(Some(value))
    }
}

impl<T: Serialize> Encoder<&T> for FrameCodec<T> {
    type Error = RuncoreError;

    fn encode(&mut self, value: &T, dst: &mut BytesMut) -> RuncoreResult<()> {
        let payload = serde_json::to_vec(value)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(RuncoreError::FrameTooLarge {
                size: payload.len() as u64,
                max: MAX_FRAME_LEN as u64,
            });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(FRAME_MAGIC);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
