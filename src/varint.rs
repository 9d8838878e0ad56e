//! QUIC variable-length integers (RFC 9000 Section 16).
//!
//! The two most significant bits of the first byte select the encoded
//! length: 1, 2, 4 or 8 bytes.

use bytes::{BufMut, BytesMut};

pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Encoded size of `value` in bytes.
pub fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append `value` to `buf`. Values above [`VARINT_MAX`] are not
/// representable and are truncated to it.
pub fn encode_varint(buf: &mut BytesMut, value: u64) {
    let value = value.min(VARINT_MAX);
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16((value as u16) | 0x4000),
        4 => buf.put_u32((value as u32) | 0x8000_0000),
        _ => buf.put_u64(value | 0xc000_0000_0000_0000),
    }
}

/// Decode one varint from the front of `buf`. Returns the value and the
/// number of bytes consumed, or `None` when `buf` holds a partial
/// encoding.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = (first & 0x3f) as u64;
    for &byte in &buf[1..len] {
        value = (value << 8) | byte as u64;
    }
    Some((value, len))
}
