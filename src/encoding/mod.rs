//! Little-endian binary encoding for the three scalar types every
//! on-disk format in this crate is built from: sstable headers and
//! indexes, kvec segments, and HNSW dumps all reduce to sequences of
//! `u32`, `u64`, and `f32` fields with no variable-length framing.
//!
//! # Wire format
//!
//! | Rust type | Encoding                   |
//! |-----------|----------------------------|
//! | `u32`     | 4 bytes, little-endian     |
//! | `u64`     | 8 bytes, little-endian     |
//! | `f32`     | 4 bytes, little-endian (IEEE-754) |
//!
//! There are no length-prefixed or tagged forms here: every caller
//! already knows its own record shape (a fixed header layout, a fixed
//! vector dimension, a fixed key/offset pair), so a general-purpose
//! framing scheme would just be dead weight.

use thiserror::Error;

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },
}

/// Serialize `self` into a byte buffer.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can advance a cursor
/// through a buffer holding several encoded fields back to back.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let bytes: [u8; 4] = buf[..4].try_into().expect("checked above");
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 8)?;
        let bytes: [u8; 8] = buf[..8].try_into().expect("checked above");
        Ok((u64::from_le_bytes(bytes), 8))
    }
}

impl Encode for f32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for f32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let bytes: [u8; 4] = buf[..4].try_into().expect("checked above");
        Ok((f32::from_le_bytes(bytes), 4))
    }
}
