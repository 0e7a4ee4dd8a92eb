//! Lowercase hex for hashes in diagnostics and CLI output.

use crate::HashError;

const DIGITS: &[u8; 16] = b"0123456789abcdef";

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

pub fn hex_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|&b| [DIGITS[usize::from(b >> 4)], DIGITS[usize::from(b & 0x0f)]])
        .map(char::from)
        .collect()
}

/// Fill `buf` from `hex`, which must hold exactly two digits per byte.
pub fn hex_decode(hex: &str, buf: &mut [u8]) -> Result<(), HashError> {
    let digits = hex.as_bytes();
    if digits.len() != 2 * buf.len() {
        return Err(HashError::InvalidHexLength {
            expected: 2 * buf.len(),
            actual: digits.len(),
        });
    }
    let value = |position: usize| {
        nibble(digits[position]).ok_or(HashError::InvalidHex {
            position,
            character: char::from(digits[position]),
        })
    };
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = value(2 * i)? << 4 | value(2 * i + 1)?;
    }
    Ok(())
}

pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, HashError> {
    if hex.len() % 2 == 1 {
        return Err(HashError::InvalidHexLength {
            expected: hex.len() + 1,
            actual: hex.len(),
        });
    }
    let mut buf = vec![0u8; hex.len() / 2];
    hex_decode(hex, &mut buf)?;
    Ok(buf)
}
