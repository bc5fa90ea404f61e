//! Deterministic little-endian binary encoding.
//!
//! Two small traits, [`Encode`] and [`Decode`], cover everything the crate
//! persists or ships between workers: fixed-width integers, length-prefixed
//! byte strings and fixed byte arrays.
//!
//! # Wire format
//!
//! | Rust type    | Encoding                                 |
//! |--------------|------------------------------------------|
//! | `u32`        | 4 bytes, little-endian                   |
//! | `u64`        | 8 bytes, little-endian                   |
//! | `[u8; N]`    | `N` raw bytes, no length prefix          |
//! | `Vec<u8>`    | `[u32 len][bytes]`                       |
//!
//! Decoders never panic: a short buffer yields
//! [`EncodingError::UnexpectedEof`] and oversized length prefixes yield
//! [`EncodingError::LengthOverflow`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Upper bound for a decoded `Vec<u8>` (64 MiB).
///
/// Anything larger is treated as corruption rather than allocated.
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A length prefix exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Bytes were left over after a value that must span the whole buffer.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to a byte buffer.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the front of a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer holding
/// several encoded items back to back.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value that must occupy all of `buf`.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let (value, consumed) = T::decode_from(buf)?;
    if consumed != buf.len() {
        return Err(EncodingError::TrailingBytes(buf.len() - consumed));
    }
    Ok(value)
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

/// Copies the first `N` bytes of `buf` into an array.
#[inline]
fn take_array<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    require(buf, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

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
        Ok((u32::from_le_bytes(take_array(buf)?), 4))
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
        Ok((u64::from_le_bytes(take_array(buf)?), 8))
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings
// ------------------------------------------------------------------------------------------------

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((take_array(buf)?, N))
    }
}

impl Encode for [u8] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = u32::try_from(self.len()).map_err(|_| {
            EncodingError::LengthOverflow(format!("length {} exceeds u32::MAX", self.len()))
        })?;
        len.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, _) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte length {len} exceeds limit {MAX_BYTE_LEN}"
            )));
        }
        let end = 4 + len as usize;
        require(buf, end)?;
        Ok((buf[4..end].to_vec(), end))
    }
}
