use std::io::Read;
use std::path::Path;

use crate::{ContentHash, HashAlgorithm, HashError};

enum HasherInner {
    Sha1(Box<sha1_checked::Sha1>),
    Sha256(sha2::Sha256),
}

/// Streaming hash computation.
///
/// Wraps SHA-1 (with collision detection) and SHA-256 behind one interface.
/// Data is fed with [`update`](Hasher::update) or through [`std::io::Write`],
/// then finalised into a [`ContentHash`].
pub struct Hasher {
    inner: HasherInner,
}

impl Hasher {
    pub fn new(algo: HashAlgorithm) -> Self {
        use digest::Digest;
        let inner = match algo {
            HashAlgorithm::Sha1 => HasherInner::Sha1(Box::new(sha1_checked::Sha1::new())),
            HashAlgorithm::Sha256 => HasherInner::Sha256(sha2::Sha256::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        use digest::Digest;
        match &mut self.inner {
            HasherInner::Sha1(h) => h.update(data),
            HasherInner::Sha256(h) => h.update(data),
        }
    }

    /// Finalize and return the hash.
    ///
    /// Returns an error if SHA-1 collision detection fires.
    pub fn finalize(self) -> Result<ContentHash, HashError> {
        match self.inner {
            HasherInner::Sha1(h) => {
                let result = h.try_finalize();
                if result.has_collision() {
                    return Err(HashError::Sha1Collision);
                }
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(result.hash().as_slice());
                Ok(ContentHash::Sha1(bytes))
            }
            HasherInner::Sha256(h) => {
                use digest::Digest;
                let result = h.finalize();
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(result.as_slice());
                Ok(ContentHash::Sha256(bytes))
            }
        }
    }

    /// Hash `data` in one call.
    pub fn digest(algo: HashAlgorithm, data: &[u8]) -> Result<ContentHash, HashError> {
        let mut h = Self::new(algo);
        h.update(data);
        h.finalize()
    }

    /// Hash an object: `"{type} {len}\0{content}"`.
    pub fn hash_object(
        algo: HashAlgorithm,
        obj_type: &str,
        data: &[u8],
    ) -> Result<ContentHash, HashError> {
        let header = format!("{} {}\0", obj_type, data.len());
        let mut h = Self::new(algo);
        h.update(header.as_bytes());
        h.update(data);
        h.finalize()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Blob hash of an in-memory byte stream.
pub fn hash_blob(algo: HashAlgorithm, data: &[u8]) -> Result<ContentHash, HashError> {
    Hasher::hash_object(algo, "blob", data)
}

/// Blob hash of a file's content, streamed from disk.
///
/// The length header is taken from the file's metadata, so the file is read
/// only once.
pub fn hash_file(algo: HashAlgorithm, path: impl AsRef<Path>) -> Result<ContentHash, HashError> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let len = file.metadata()?.len();
    let mut hasher = Hasher::new(algo);
    hasher.update(format!("blob {len}\0").as_bytes());

    let mut buf = [0u8; 64 * 1024];
    let mut seen = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        seen += n as u64;
        hasher.update(&buf[..n]);
    }
    if seen != len {
        return Err(HashError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "file changed size while hashing",
        )));
    }
    hasher.finalize()
}
