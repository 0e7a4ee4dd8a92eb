use std::fmt;
use std::str::FromStr;

use crate::hex::{hex_decode, hex_to_string};
use crate::{HashAlgorithm, HashError};

/// Identifier of a blob's content, as stored in an index entry.
///
/// The width follows the repository's hash algorithm; the bytes are carried
/// inline so entries stay `Copy`-cheap to compare.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl ContentHash {
    pub const NULL_SHA1: Self = Self::Sha1([0u8; 20]);
    pub const NULL_SHA256: Self = Self::Sha256([0u8; 32]);

    /// Build a hash from raw digest bytes.
    pub fn from_bytes(bytes: &[u8], algo: HashAlgorithm) -> Result<Self, HashError> {
        let expected = algo.digest_len();
        if bytes.len() != expected {
            return Err(HashError::InvalidHashLength {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(match algo {
            HashAlgorithm::Sha1 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                Self::Sha1(arr)
            }
            HashAlgorithm::Sha256 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Self::Sha256(arr)
            }
        })
    }

    /// Parse a hex string; the algorithm is inferred from its length.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let algo = HashAlgorithm::from_hex_len(hex.len()).ok_or(HashError::InvalidHexLength {
            expected: 40,
            actual: hex.len(),
        })?;
        match algo {
            HashAlgorithm::Sha1 => {
                let mut bytes = [0u8; 20];
                hex_decode(hex, &mut bytes)?;
                Ok(Self::Sha1(bytes))
            }
            HashAlgorithm::Sha256 => {
                let mut bytes = [0u8; 32];
                hex_decode(hex, &mut bytes)?;
                Ok(Self::Sha256(bytes))
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(b) => b,
            Self::Sha256(b) => b,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// True when this is the hash of zero-length content.
    pub fn is_empty_blob(&self) -> bool {
        *self == self.algorithm().empty_blob()
    }

    pub fn to_hex(&self) -> String {
        hex_to_string(self.as_bytes())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..8])
    }
}

impl FromStr for ContentHash {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA1_HEX: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    #[test]
    fn hex_roundtrip_sha1() {
        let hash = ContentHash::from_hex(EMPTY_SHA1_HEX).unwrap();
        assert_eq!(hash.algorithm(), HashAlgorithm::Sha1);
        assert_eq!(hash.to_string(), EMPTY_SHA1_HEX);
        assert!(hash.is_empty_blob());
    }

    #[test]
    fn debug_shows_short_hash() {
        let hash = ContentHash::from_hex(EMPTY_SHA1_HEX).unwrap();
        assert_eq!(format!("{hash:?}"), "ContentHash(e69de29b)");
    }

    #[test]
    fn null_hashes() {
        assert!(ContentHash::NULL_SHA1.is_null());
        assert!(HashAlgorithm::Sha256.null_hash().is_null());
        assert!(!ContentHash::NULL_SHA1.is_empty_blob());
    }

    #[test]
    fn from_bytes_wrong_length() {
        let err = ContentHash::from_bytes(&[0; 10], HashAlgorithm::Sha1).unwrap_err();
        assert!(matches!(
            err,
            HashError::InvalidHashLength {
                expected: 20,
                actual: 10
            }
        ));
    }

    #[test]
    fn invalid_hex() {
        assert!(matches!(
            ContentHash::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"),
            Err(HashError::InvalidHex { .. })
        ));
        assert!(matches!(
            ContentHash::from_hex("abcd"),
            Err(HashError::InvalidHexLength { .. })
        ));
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = ContentHash::from_hex("0000000000000000000000000000000000000001").unwrap();
        let b = ContentHash::from_hex("0000000000000000000000000000000000000002").unwrap();
        assert!(a < b);
    }
}
