//! On-disk codecs.
//!
//! Every index file starts with `DIRC` and a u32 version. Versions 2 to 4
//! store a flat entry array ([`ArrayCodec`]); version 5 groups entries by
//! directory ([`TreeCodec`]). The stored version picks the codec; the
//! in-memory state does not depend on it.

mod array;
mod dirs;
mod mapped;
mod v5;

use dirc_hash::HashAlgorithm;

use crate::entry::{EntryFlags, IndexEntry};
use crate::state::IndexState;
use crate::IndexError;

pub use array::ArrayCodec;
pub use dirs::{children, group_directories, DirectoryEntry};
pub use mapped::MappedIndex;
pub use v5::{DirectoryRecord, TreeCodec};

/// Magic bytes at the start of every index file.
pub const SIGNATURE: &[u8; 4] = b"DIRC";

/// One on-disk format.
pub trait IndexCodec {
    fn version(&self) -> u32;

    /// Append the encoded form of `state` to `out`.
    fn encode(&self, state: &IndexState, out: &mut Vec<u8>) -> Result<(), IndexError>;

    fn decode(&self, data: &[u8], algo: HashAlgorithm) -> Result<IndexState, IndexError>;
}

/// Entries that are written to disk, in index order.
///
/// Fails on an entry whose hash is still null, such as a placeholder left by
/// [`IndexState::read_unmerged`].
pub(crate) fn live_entries(state: &IndexState) -> Result<Vec<&IndexEntry>, IndexError> {
    let mut live = Vec::with_capacity(state.entries.len());
    for entry in &state.entries {
        if entry.is_resolve_undo() || entry.flags.contains(EntryFlags::REMOVE) {
            continue;
        }
        if entry.hash.is_null() {
            return Err(IndexError::NullHash {
                path: entry.path.clone(),
            });
        }
        live.push(entry);
    }
    Ok(live)
}

/// Codec for a stored or requested version.
pub fn codec_for(version: u32) -> Result<Box<dyn IndexCodec>, IndexError> {
    match version {
        2..=4 => Ok(Box::new(ArrayCodec::new(version))),
        5 => Ok(Box::new(TreeCodec)),
        other => Err(IndexError::UnsupportedVersion(other)),
    }
}

/// Check the magic and return the stored version.
pub fn read_header(data: &[u8]) -> Result<u32, IndexError> {
    let mut r = Reader::new(data);
    if r.take(4)? != SIGNATURE {
        return Err(IndexError::corrupt("bad signature"));
    }
    let version = r.u32()?;
    if !(2..=5).contains(&version) {
        return Err(IndexError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Bounds-checked big-endian reader over a byte slice.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn at(data: &'a [u8], pos: usize) -> Result<Self, IndexError> {
        if pos > data.len() {
            return Err(truncated(pos));
        }
        Ok(Self { data, pos })
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<(), IndexError> {
        if pos > self.data.len() {
            return Err(truncated(pos));
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated(self.pos))?;
        let bytes = self.data.get(self.pos..end).ok_or_else(|| truncated(self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, IndexError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes up to the next NUL; the NUL is consumed.
    pub(crate) fn cstr(&mut self) -> Result<&'a [u8], IndexError> {
        let len = self
            .rest()
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| IndexError::corrupt(format!("missing NUL after offset {}", self.pos)))?;
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len + 1;
        Ok(s)
    }
}

fn truncated(pos: usize) -> IndexError {
    IndexError::corrupt(format!("truncated at offset {pos}"))
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_checks() {
        assert_eq!(read_header(b"DIRC\0\0\0\x02\0\0\0\0").unwrap(), 2);
        assert_eq!(read_header(b"DIRC\0\0\0\x05").unwrap(), 5);
        assert!(matches!(
            read_header(b"DIRC\0\0\0\x06"),
            Err(IndexError::UnsupportedVersion(6))
        ));
        assert!(matches!(read_header(b"CRID\0\0\0\x02"), Err(IndexError::Corrupt { .. })));
        assert!(matches!(read_header(b"DIR"), Err(IndexError::Corrupt { .. })));
    }

    #[test]
    fn codec_selection() {
        for v in 2..=5 {
            assert_eq!(codec_for(v).unwrap().version(), v);
        }
        assert!(matches!(codec_for(1), Err(IndexError::UnsupportedVersion(1))));
    }

    #[test]
    fn reader_bounds() {
        let mut r = Reader::new(b"ab\0\x00\x01");
        assert_eq!(r.cstr().unwrap(), b"ab");
        assert_eq!(r.u16().unwrap(), 1);
        assert_eq!(r.remaining(), 0);
        assert!(r.u16().is_err());
        assert!(Reader::new(b"abc").cstr().is_err());
        assert!(Reader::at(b"abc", 4).is_err());
    }
}
