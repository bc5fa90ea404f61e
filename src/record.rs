//! Value codec for the torture workload.
//!
//! Every key in the key space `1..=num_keys` is stored as its 4-byte
//! big-endian representation (so byte order equals numeric order), and the
//! value written for it is a [`Record`]: the key again plus the sequence
//! number of the write pass that produced it.
//!
//! ```text
//! value := [key: u32 LE][seq: u64 LE]     (12 bytes)
//! ```
//!
//! Echoing the key inside the value lets readers detect a store that
//! returns the right-sized value for the wrong key.

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Size of an encoded store key in bytes.
pub const KEY_LEN: usize = 4;

/// The payload written for a key on each rewrite pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub key: u32,
    pub seq: u64,
}

impl Record {
    pub fn new(key: u32, seq: u64) -> Self {
        Self { key, seq }
    }

    /// Encodes the record as a store value.
    pub fn to_value(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    /// Decodes a store value. The whole slice must be consumed.
    pub fn from_value(value: &[u8]) -> Result<Self, EncodingError> {
        encoding::decode_exact(value)
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.seq.encode_to(buf)
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, n1) = u32::decode_from(buf)?;
        let (seq, n2) = u64::decode_from(&buf[n1..])?;
        Ok((Self { key, seq }, n1 + n2))
    }
}

/// Encodes a workload key as a store key.
pub fn encode_key(key: u32) -> [u8; KEY_LEN] {
    key.to_be_bytes()
}

/// Decodes a store key produced by [`encode_key`].
pub fn decode_key(raw: &[u8]) -> Result<u32, EncodingError> {
    let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| {
        if raw.len() < KEY_LEN {
            EncodingError::UnexpectedEof {
                needed: KEY_LEN,
                available: raw.len(),
            }
        } else {
            EncodingError::TrailingBytes(raw.len() - KEY_LEN)
        }
    })?;
    Ok(u32::from_be_bytes(bytes))
}
