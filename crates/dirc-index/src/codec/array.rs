//! Index file reading and writing for versions 2, 3 and 4.

use bstr::BString;
use dirc_hash::hasher::Hasher;
use dirc_hash::{ContentHash, HashAlgorithm};

use super::{live_entries, put_u16, put_u32, IndexCodec, Reader, SIGNATURE};
use crate::entry::{verify_path, EntryFlags, FileMode, IndexEntry, StatData, StatInfo, Timestamp};
use crate::extensions::tree::CacheTree;
use crate::extensions::{reuc, ExtensionKind};
use crate::state::IndexState;
use crate::{IndexError, Stage};

/// Stat fields plus mode: ctime(8) mtime(8) dev ino mode uid gid size.
const ONDISK_STAT_SIZE: usize = 40;

const FLAG_VALID: u16 = 0x8000;
const FLAG_EXTENDED: u16 = 0x4000;
const FLAG_STAGE_MASK: u16 = 0x3000;
const FLAG_STAGE_SHIFT: u16 = 12;
const NAME_MASK: u16 = 0x0FFF;

const EXT_INTENT_TO_ADD: u16 = 0x2000;
const EXT_SKIP_WORKTREE: u16 = 0x4000;
const EXT_KNOWN: u16 = EXT_INTENT_TO_ADD | EXT_SKIP_WORKTREE;

/// Flat entry array, optionally with prefix-compressed names (v4).
#[derive(Debug, Clone, Copy)]
pub struct ArrayCodec {
    version: u32,
    verify_checksum: bool,
}

impl ArrayCodec {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            verify_checksum: true,
        }
    }

    /// Skip the trailing-checksum check when decoding.
    pub fn skip_checksum(mut self, skip: bool) -> Self {
        self.verify_checksum = !skip;
        self
    }
}

/// On-disk size of a v2/v3 entry: `(name offset + name + 8) & !7`.
fn ondisk_entry_size(hash_len: usize, name_len: usize, extended: bool) -> usize {
    let name_off = ONDISK_STAT_SIZE + hash_len + if extended { 4 } else { 2 };
    (name_off + name_len + 8) & !7
}

impl IndexCodec for ArrayCodec {
    fn version(&self) -> u32 {
        self.version
    }

    fn encode(&self, state: &IndexState, out: &mut Vec<u8>) -> Result<(), IndexError> {
        let start = out.len();
        let algo = state.hash_algorithm();
        let live = live_entries(state)?;

        let needs_extended = live.iter().any(|e| e.needs_extended());
        let version = match self.version {
            2 if needs_extended => {
                tracing::debug!("extended flags present, writing version 3");
                3
            }
            3 if !needs_extended => {
                tracing::debug!("no extended flags, writing version 2");
                2
            }
            v => v,
        };

        out.extend_from_slice(SIGNATURE);
        put_u32(out, version);
        put_u32(out, live.len() as u32);

        let mut prev: &[u8] = b"";
        for entry in &live {
            encode_entry(out, entry, version, prev);
            prev = &entry.path;
        }

        if let Some(tree) = state.cache_tree() {
            write_extension(out, CacheTree::SIGNATURE, &tree.serialize());
        }
        let undo = state.resolve_undo_entries();
        if !undo.is_empty() {
            let data = reuc::serialize(undo.iter().map(|(p, info)| (p.as_slice(), info)));
            write_extension(out, reuc::SIGNATURE, &data);
        }

        let checksum = Hasher::digest(algo, &out[start..])?;
        out.extend_from_slice(checksum.as_bytes());

        tracing::debug!(version, entries = live.len(), bytes = out.len() - start, "encoded index");
        Ok(())
    }

    fn decode(&self, data: &[u8], algo: HashAlgorithm) -> Result<IndexState, IndexError> {
        let hash_len = algo.digest_len();
        if data.len() < 12 + hash_len {
            return Err(IndexError::corrupt("index file too short"));
        }
        let (body, trailer) = data.split_at(data.len() - hash_len);
        if self.verify_checksum {
            let computed = Hasher::digest(algo, body)?;
            if computed.as_bytes() != trailer {
                return Err(IndexError::ChecksumMismatch);
            }
        }

        let version = super::read_header(body)?;
        if !(2..=4).contains(&version) {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let mut r = Reader::at(body, 8)?;
        let count = r.u32()? as usize;

        // Smallest possible record is a v4 entry with a one-byte name.
        let mut entries = Vec::with_capacity(count.min(body.len() / (ONDISK_STAT_SIZE + 4)));
        let mut prev = BString::default();
        for _ in 0..count {
            let entry = decode_entry(&mut r, version, &prev, algo)?;
            tracing::trace!(path = %entry.path, stage = entry.stage.as_u8(), "decoded entry");
            prev.clone_from(&entry.path);
            entries.push(entry);
        }

        let mut cache_tree = None;
        let mut resolve_undo = Vec::new();
        let mut unknown = Vec::new();
        while r.remaining() >= 8 {
            let mut signature = [0u8; 4];
            signature.copy_from_slice(r.take(4)?);
            let size = r.u32()? as usize;
            let payload = r.take(size).map_err(|_| {
                IndexError::corrupt(format!(
                    "extension {} exceeds file",
                    String::from_utf8_lossy(&signature)
                ))
            })?;
            match ExtensionKind::classify(&signature) {
                ExtensionKind::CacheTree => cache_tree = Some(CacheTree::parse(payload, algo)?),
                ExtensionKind::ResolveUndo => resolve_undo = reuc::parse(payload, algo)?,
                ExtensionKind::Required => {
                    return Err(IndexError::UnsupportedExtension {
                        signature: String::from_utf8_lossy(&signature).into_owned(),
                    })
                }
                ExtensionKind::Ignorable => {
                    tracing::warn!(
                        signature = %String::from_utf8_lossy(&signature),
                        size,
                        "ignoring unknown index extension"
                    );
                    unknown.push(signature);
                }
            }
        }
        if r.remaining() != 0 {
            return Err(IndexError::corrupt("garbage after extensions"));
        }

        let mut state = IndexState::from_parts(version, algo, entries, cache_tree, resolve_undo)?;
        state.unknown_extensions = unknown;
        tracing::debug!(version, entries = state.len(), "decoded index");
        Ok(state)
    }
}

fn write_extension(out: &mut Vec<u8>, signature: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(signature);
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

fn encode_entry(out: &mut Vec<u8>, entry: &IndexEntry, version: u32, prev: &[u8]) {
    let start = out.len();
    let sd = match entry.stat {
        StatInfo::Full(sd) => sd,
        // Only mtime survives a trip through the compact encoding.
        StatInfo::Compact { mtime, .. } => StatData {
            mtime,
            ..StatData::default()
        },
    };
    for word in [
        sd.ctime.secs,
        sd.ctime.nsecs,
        sd.mtime.secs,
        sd.mtime.nsecs,
        sd.dev,
        sd.ino,
        entry.mode.raw(),
        sd.uid,
        sd.gid,
        sd.size,
    ] {
        put_u32(out, word);
    }
    out.extend_from_slice(entry.hash.as_bytes());

    let extended = version >= 3 && entry.needs_extended();
    let mut flags = entry.path.len().min(NAME_MASK as usize) as u16;
    flags |= (entry.stage.as_u8() as u16) << FLAG_STAGE_SHIFT;
    if entry.flags.contains(EntryFlags::VALID) {
        flags |= FLAG_VALID;
    }
    if extended {
        flags |= FLAG_EXTENDED;
    }
    put_u16(out, flags);
    if extended {
        let mut ext = 0;
        if entry.flags.contains(EntryFlags::INTENT_TO_ADD) {
            ext |= EXT_INTENT_TO_ADD;
        }
        if entry.flags.contains(EntryFlags::SKIP_WORKTREE) {
            ext |= EXT_SKIP_WORKTREE;
        }
        put_u16(out, ext);
    }

    if version == 4 {
        let common = prev
            .iter()
            .zip(entry.path.iter())
            .take_while(|(a, b)| a == b)
            .count();
        dirc_utils::varint::encode((prev.len() - common) as u64, out);
        out.extend_from_slice(&entry.path[common..]);
        out.push(0);
    } else {
        out.extend_from_slice(&entry.path);
        let size = ondisk_entry_size(entry.hash.as_bytes().len(), entry.path.len(), extended);
        out.resize(start + size, 0);
    }
}

fn decode_entry(
    r: &mut Reader<'_>,
    version: u32,
    prev: &[u8],
    algo: HashAlgorithm,
) -> Result<IndexEntry, IndexError> {
    let start = r.pos();
    let mut words = [0u32; 10];
    for w in &mut words {
        *w = r.u32()?;
    }
    let [ctime_s, ctime_ns, mtime_s, mtime_ns, dev, ino, mode, uid, gid, size] = words;
    let hash = ContentHash::from_bytes(r.take(algo.digest_len())?, algo)?;

    let flags = r.u16()?;
    let extended = flags & FLAG_EXTENDED != 0;
    let stage = Stage::from_u8(((flags & FLAG_STAGE_MASK) >> FLAG_STAGE_SHIFT) as u8)?;
    let name_len = (flags & NAME_MASK) as usize;

    let mut entry_flags = EntryFlags::empty();
    if flags & FLAG_VALID != 0 {
        entry_flags |= EntryFlags::VALID;
    }
    if extended {
        if version < 3 {
            return Err(IndexError::corrupt(format!(
                "extended flags in version {version} entry at offset {start}"
            )));
        }
        let ext = r.u16()?;
        if ext & !EXT_KNOWN != 0 {
            return Err(IndexError::corrupt(format!(
                "unknown extended flags {ext:#06x} at offset {start}"
            )));
        }
        if ext & EXT_INTENT_TO_ADD != 0 {
            entry_flags |= EntryFlags::INTENT_TO_ADD;
        }
        if ext & EXT_SKIP_WORKTREE != 0 {
            entry_flags |= EntryFlags::SKIP_WORKTREE;
        }
    }

    let path = if version == 4 {
        let (strip, used) = dirc_utils::varint::decode(r.rest())
            .map_err(|e| IndexError::corrupt(format!("entry at offset {start}: {e}")))?;
        r.take(used)?;
        let strip = usize::try_from(strip)
            .ok()
            .filter(|&s| s <= prev.len())
            .ok_or_else(|| {
                IndexError::corrupt(format!("name strip length out of range at offset {start}"))
            })?;
        let mut path = BString::from(&prev[..prev.len() - strip]);
        path.extend_from_slice(r.cstr()?);
        path
    } else {
        let name_start = r.pos();
        let name = r.cstr()?;
        let size = ondisk_entry_size(algo.digest_len(), name.len(), extended);
        r.seek(start + size)?;
        // The terminating NUL has to fall inside the record.
        if name_start + name.len() >= start + size {
            return Err(IndexError::corrupt(format!("entry name overruns record at offset {start}")));
        }
        BString::from(name)
    };

    if name_len != NAME_MASK as usize && name_len != path.len() {
        return Err(IndexError::corrupt(format!(
            "name length mismatch for '{path}' at offset {start}"
        )));
    }
    if !verify_path(&path) {
        return Err(IndexError::corrupt(format!("invalid path '{path}' at offset {start}")));
    }

    Ok(IndexEntry {
        path,
        hash,
        mode: FileMode::from_raw(mode),
        stage,
        stat: StatInfo::Full(StatData {
            ctime: Timestamp::new(ctime_s, ctime_ns),
            mtime: Timestamp::new(mtime_s, mtime_ns),
            dev,
            ino,
            uid,
            gid,
            size,
        }),
        flags: entry_flags,
    })
}
