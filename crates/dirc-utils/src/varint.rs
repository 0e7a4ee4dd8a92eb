//! Offset varints, as used by the v4 index name delta.
//!
//! Unlike LEB128 the encoding is big-endian and each continuation adds one to
//! the accumulated value, so every integer has exactly one encoding.

use crate::{Result, UtilError};

/// Append the varint encoding of `value` to `out`. Returns the number of bytes written.
pub fn encode(mut value: u64, out: &mut Vec<u8>) -> usize {
    let mut buf = [0u8; 16];
    let mut pos = buf.len() - 1;
    buf[pos] = (value & 0x7f) as u8;
    loop {
        value >>= 7;
        if value == 0 {
            break;
        }
        value -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7f) as u8;
    }
    out.extend_from_slice(&buf[pos..]);
    buf.len() - pos
}

/// Decode a varint from the front of `data`. Returns `(value, bytes_consumed)`.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let mut iter = data.iter();
    let mut c = *iter.next().ok_or(UtilError::TruncatedVarint)?;
    let mut value = u64::from(c & 0x7f);
    let mut used = 1;
    while c & 0x80 != 0 {
        c = *iter.next().ok_or(UtilError::TruncatedVarint)?;
        used += 1;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_mul(128))
            .ok_or(UtilError::VarintOverflow)?
            | u64::from(c & 0x7f);
    }
    Ok((value, used))
}
