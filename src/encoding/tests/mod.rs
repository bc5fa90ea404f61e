//! Tests for the primitive codec: exact byte layout, bounds checks and
//! trailing-byte detection.

use crate::encoding::*;

#[test]
fn u32_is_little_endian() {
    let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
    assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(decode_exact::<u32>(&bytes).unwrap(), 0xDEAD_BEEF);
}

#[test]
fn u64_is_little_endian() {
    let bytes = encode_to_vec(&0x0102_0304_0506_0708u64).unwrap();
    assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn short_buffer_reports_needed_bytes() {
    let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
    assert_eq!(
        err,
        EncodingError::UnexpectedEof {
            needed: 8,
            available: 3
        }
    );
}

#[test]
fn bytes_are_length_prefixed() {
    let bytes = encode_to_vec(&b"abc".to_vec()).unwrap();
    assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);
    let (decoded, consumed) = Vec::<u8>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, b"abc");
    assert_eq!(consumed, 7);
}

#[test]
fn bytes_truncated_payload_is_eof() {
    let err = Vec::<u8>::decode_from(&[5, 0, 0, 0, 1, 2]).unwrap_err();
    assert!(matches!(err, EncodingError::UnexpectedEof { needed: 9, .. }));
}

#[test]
fn bytes_oversized_length_rejected_before_allocation() {
    let mut buf = Vec::new();
    (MAX_BYTE_LEN + 1).encode_to(&mut buf).unwrap();
    let err = Vec::<u8>::decode_from(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn decode_exact_rejects_trailing_bytes() {
    let mut bytes = encode_to_vec(&7u32).unwrap();
    bytes.push(0);
    assert_eq!(
        decode_exact::<u32>(&bytes).unwrap_err(),
        EncodingError::TrailingBytes(1)
    );
}

#[test]
fn fixed_array_has_no_prefix() {
    let bytes = encode_to_vec(b"CASK").unwrap();
    assert_eq!(bytes, b"CASK");
    let (magic, consumed) = <[u8; 4]>::decode_from(&bytes).unwrap();
    assert_eq!(&magic, b"CASK");
    assert_eq!(consumed, 4);
}
