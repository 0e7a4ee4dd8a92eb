//! CRC32 helpers for the directory-tree index format.
//!
//! Every v5 record is followed by a big-endian CRC32 over its bytes; file
//! records chain from a seed so that moving a record invalidates it.

/// CRC32 of `data`, continuing from `seed` (0 for a fresh checksum).
pub fn crc32_with_seed(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// CRC32 over a sequence of big-endian `u32` fields.
pub fn crc32_of_words(words: &[u32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for w in words {
        hasher.update(&w.to_be_bytes());
    }
    hasher.finalize()
}

/// Check the 4-byte big-endian CRC stored right after `data`.
pub fn verify(seed: u32, data: &[u8], stored: u32) -> bool {
    crc32_with_seed(seed, data) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_crc_continues_plain_crc() {
        let whole = crc32(b"hello world");
        let first = crc32(b"hello ");
        assert_eq!(crc32_with_seed(first, b"world"), whole);
    }

    #[test]
    fn words_are_big_endian() {
        assert_eq!(crc32_of_words(&[1, 2]), crc32(&[0, 0, 0, 1, 0, 0, 0, 2]));
    }

    #[test]
    fn verify_detects_change() {
        let stored = crc32(b"record");
        assert!(verify(0, b"record", stored));
        assert!(!verify(0, b"recorD", stored));
    }
}
