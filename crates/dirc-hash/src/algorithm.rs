use crate::ContentHash;

/// Hash algorithm of a repository; decides the on-disk width of every hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-1, 20 bytes.
    #[default]
    Sha1,
    /// SHA-256, 32 bytes.
    Sha256,
}

impl HashAlgorithm {
    /// Length of the raw digest in bytes.
    pub const fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Length of the hex representation.
    pub const fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    /// The all-zeros hash for this algorithm.
    pub const fn null_hash(&self) -> ContentHash {
        match self {
            Self::Sha1 => ContentHash::NULL_SHA1,
            Self::Sha256 => ContentHash::NULL_SHA256,
        }
    }

    /// Hash of the empty blob (`"blob 0\0"`).
    ///
    /// Entries recorded with zero size or zero mtime are only trusted when they
    /// carry this hash.
    pub const fn empty_blob(&self) -> ContentHash {
        match self {
            Self::Sha1 => ContentHash::Sha1([
                0xe6, 0x9d, 0xe2, 0x9b, 0xb2, 0xd1, 0xd6, 0x43, 0x4b, 0x8b, 0x29, 0xae, 0x77,
                0x5a, 0xd8, 0xc2, 0xe4, 0x8c, 0x53, 0x91,
            ]),
            Self::Sha256 => ContentHash::Sha256([
                0x47, 0x3a, 0x0f, 0x4c, 0x3b, 0xe8, 0xa9, 0x36, 0x81, 0xa2, 0x67, 0xe3, 0xb1,
                0xe9, 0xa7, 0xdc, 0xda, 0x11, 0x85, 0x43, 0x6f, 0xe1, 0x41, 0xf7, 0x74, 0x91,
                0x20, 0xa3, 0x03, 0x72, 0x18, 0x13,
            ]),
        }
    }

    /// Look up an algorithm by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Look up an algorithm by raw digest length.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Look up an algorithm by hex length.
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
