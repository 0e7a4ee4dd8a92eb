//! Version 5: entries grouped under per-directory records.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! header      DIRC | 5 | ndir | nfile | nextensions | crc
//! dir table   ndir x u32, offsets relative to the directory block
//! dir block   per directory: path/ NUL | flags u16 | foffset | cr | ncr |
//!             nsubtrees | nfiles | nentries | hash | crc
//! file table  nfile x u32, absolute offsets of file records
//! files       name NUL | flags u16 | mode u16 | mtime | mtime ns |
//!             stat crc | hash | crc (seeded by the file table slot)
//! conflicts   name NUL | nparts | nparts x (flags u16 | mode u16 | hash) | crc
//! ```
//!
//! There is no trailing digest; every record carries its own CRC32.

use std::cmp::Ordering;

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};
use dirc_utils::crc;

use super::dirs::{group_directories, parent_of, DirectoryEntry};
use super::{live_entries, put_u16, put_u32, IndexCodec, Reader, SIGNATURE};
use crate::entry::{verify_path, EntryFlags, FileMode, IndexEntry, StatInfo, Timestamp};
use crate::extensions::tree::{CacheTree, CacheTreeNode};
use crate::resolve_undo::ResolveUndoInfo;
use crate::state::IndexState;
use crate::{IndexError, Stage};

const HEADER_SIZE: usize = 24;

const FILE_VALID: u16 = 0x8000;
const FILE_STAGE_MASK: u16 = 0x6000;
const FILE_STAGE_SHIFT: u16 = 13;
const FILE_SKIP_WORKTREE: u16 = 0x1000;
const FILE_INTENT_TO_ADD: u16 = 0x0800;
const FILE_KNOWN: u16 = FILE_VALID | FILE_STAGE_MASK | FILE_SKIP_WORKTREE | FILE_INTENT_TO_ADD;

/// Cache-tree entry count of a directory without a valid tree.
const INVALID_TREE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeCodec;

/// A directory record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// Full path with a trailing `/`; empty for the root.
    pub path: BString,
    pub flags: u16,
    pub foffset: u32,
    pub cr: u32,
    pub ncr: u32,
    pub nsubtrees: u32,
    pub nfiles: u32,
    pub nentries: u32,
    /// Cache-tree hash; `None` when `nentries` marks the tree invalid.
    pub hash: Option<ContentHash>,
}

impl DirectoryRecord {
    fn tree_node(&self) -> CacheTreeNode {
        let mut node = CacheTreeNode::new(last_component(&self.path));
        if self.nentries != INVALID_TREE {
            if let (Ok(count), Some(hash)) = (i32::try_from(self.nentries), self.hash) {
                node.entry_count = count;
                node.hash = Some(hash);
            }
        }
        node
    }
}

fn last_component(dir: &[u8]) -> &[u8] {
    let trimmed = dir.strip_suffix(b"/").unwrap_or(dir);
    match trimmed.rfind_byte(b'/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

fn bad(reason: impl Into<String>) -> IndexError {
    IndexError::corrupt(format!("v5: {}", reason.into()))
}

impl IndexCodec for TreeCodec {
    fn version(&self) -> u32 {
        5
    }

    fn encode(&self, state: &IndexState, out: &mut Vec<u8>) -> Result<(), IndexError> {
        let algo = state.hash_algorithm();
        let hash_len = algo.digest_len();
        let live = live_entries(state)?;
        let undo = state.resolve_undo_entries();
        let file_paths: Vec<&[u8]> = live.iter().map(|e| e.path.as_slice()).collect();
        let undo_paths: Vec<&[u8]> = undo.iter().map(|(p, _)| p.as_slice()).collect();
        let dirs = group_directories(&file_paths, &undo_paths);

        let dir_sizes: Vec<usize> = dirs
            .iter()
            .map(|d| d.path.len() + 1 + 2 + 6 * 4 + hash_len + 4)
            .collect();
        let dir_block_start = HEADER_SIZE + 4 * dirs.len();
        let file_table_start = dir_block_start + dir_sizes.iter().sum::<usize>();
        let files_start = file_table_start + 4 * live.len();

        // File records first: their offsets feed the file table and the
        // directory records.
        let mut file_table = Vec::with_capacity(4 * live.len());
        let mut files = Vec::new();
        let mut foffsets = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            foffsets.push(to_u32(file_table_start + file_table.len())?);
            for &i in &dir.files {
                let offset = to_u32(files_start + files.len())?;
                put_u32(&mut file_table, offset);
                encode_file(&mut files, live[i], dir.path.len(), offset)?;
            }
        }

        let conflicts_start = files_start + files.len();
        let mut conflicts = Vec::new();
        let mut crs = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            crs.push(to_u32(conflicts_start + conflicts.len())?);
            for &i in &dir.conflicts {
                let (path, info) = &undo[i];
                encode_conflict(&mut conflicts, &path[dir.path.len()..], info)?;
            }
        }

        let start = out.len();
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(SIGNATURE);
        put_u32(&mut header, 5);
        put_u32(&mut header, to_u32(dirs.len())?);
        put_u32(&mut header, to_u32(live.len())?);
        put_u32(&mut header, 0);
        let header_crc = crc::crc32(&header);
        out.extend_from_slice(&header);
        put_u32(out, header_crc);

        let mut rel = 0usize;
        for size in &dir_sizes {
            put_u32(out, to_u32(rel)?);
            rel += size;
        }

        for (i, dir) in dirs.iter().enumerate() {
            let (nentries, hash) = tree_fields(state.cache_tree(), dir, algo);
            let record_start = out.len();
            out.extend_from_slice(&dir.path);
            out.push(0);
            put_u16(out, 0);
            put_u32(out, foffsets[i]);
            put_u32(out, crs[i]);
            put_u32(out, dir.conflicts.len() as u32);
            put_u32(out, dir.nsubtrees);
            put_u32(out, dir.files.len() as u32);
            put_u32(out, nentries);
            out.extend_from_slice(hash.as_bytes());
            let record_crc = crc::crc32(&out[record_start..]);
            put_u32(out, record_crc);
        }

        out.extend_from_slice(&file_table);
        out.extend_from_slice(&files);
        out.extend_from_slice(&conflicts);

        tracing::debug!(
            directories = dirs.len(),
            entries = live.len(),
            conflicts = undo.len(),
            bytes = out.len() - start,
            "encoded v5 index"
        );
        Ok(())
    }

    fn decode(&self, data: &[u8], algo: HashAlgorithm) -> Result<IndexState, IndexError> {
        let reader = V5Reader::open(data, algo)?;
        let records = reader.dir_range(0, reader.ndir)?;
        if !records[0].path.is_empty() {
            return Err(bad("first directory record is not the root"));
        }
        let decoded = reader.decode_dirs(&records)?;
        if decoded.entries.len() != reader.nfile {
            return Err(bad(format!(
                "header promises {} files, directories hold {}",
                reader.nfile,
                decoded.entries.len()
            )));
        }

        let cache_tree = if records.iter().any(|r| r.nentries != INVALID_TREE) {
            Some(CacheTree::new(build_tree(&records, &decoded.children, 0)))
        } else {
            None
        };
        let state =
            IndexState::from_parts(5, algo, decoded.entries, cache_tree, decoded.resolve_undo)?;
        tracing::debug!(
            directories = records.len(),
            entries = state.len(),
            "decoded v5 index"
        );
        Ok(state)
    }
}

fn to_u32(n: usize) -> Result<u32, IndexError> {
    u32::try_from(n).map_err(|_| IndexError::corrupt("index too large for version 5"))
}

fn tree_fields(
    tree: Option<&CacheTree>,
    dir: &DirectoryEntry,
    algo: HashAlgorithm,
) -> (u32, ContentHash) {
    let path = dir.path.strip_suffix(b"/").unwrap_or(&dir.path[..]);
    match tree.and_then(|t| t.find(path)) {
        Some(node) if node.is_valid() => match node.hash {
            Some(hash) => (node.entry_count as u32, hash),
            None => (INVALID_TREE, algo.null_hash()),
        },
        _ => (INVALID_TREE, algo.null_hash()),
    }
}

fn encode_file(
    out: &mut Vec<u8>,
    entry: &IndexEntry,
    dir_len: usize,
    offset: u32,
) -> Result<(), IndexError> {
    let start = out.len();
    out.extend_from_slice(&entry.path[dir_len..]);
    out.push(0);

    let mut flags = (entry.stage.as_u8() as u16) << FILE_STAGE_SHIFT;
    if entry.flags.contains(EntryFlags::VALID) {
        flags |= FILE_VALID;
    }
    if entry.flags.contains(EntryFlags::SKIP_WORKTREE) {
        flags |= FILE_SKIP_WORKTREE;
    }
    if entry.flags.contains(EntryFlags::INTENT_TO_ADD) {
        flags |= FILE_INTENT_TO_ADD;
    }
    put_u16(out, flags);
    let mode = u16::try_from(entry.mode.raw()).map_err(|_| {
        IndexError::corrupt(format!("mode {} of '{}' does not fit version 5", entry.mode, entry.path))
    })?;
    put_u16(out, mode);

    let (mtime, stat_crc) = match entry.stat {
        StatInfo::Full(sd) => (sd.mtime, sd.compact_crc()),
        StatInfo::Compact { mtime, crc } => (mtime, crc),
    };
    put_u32(out, mtime.secs);
    put_u32(out, mtime.nsecs);
    put_u32(out, stat_crc);
    out.extend_from_slice(entry.hash.as_bytes());

    let seed = crc::crc32(&offset.to_be_bytes());
    let record_crc = crc::crc32_with_seed(seed, &out[start..]);
    put_u32(out, record_crc);
    Ok(())
}

fn encode_conflict(out: &mut Vec<u8>, name: &[u8], info: &ResolveUndoInfo) -> Result<(), IndexError> {
    let start = out.len();
    out.extend_from_slice(name);
    out.push(0);
    let parts: Vec<_> = info.stages().collect();
    put_u32(out, parts.len() as u32);
    for (stage, mode, hash) in parts {
        put_u16(out, (stage.as_u8() as u16) << 1);
        let mode = u16::try_from(mode)
            .map_err(|_| IndexError::corrupt(format!("resolve-undo mode {mode:o} does not fit version 5")))?;
        put_u16(out, mode);
        out.extend_from_slice(hash.as_bytes());
    }
    let record_crc = crc::crc32(&out[start..]);
    put_u32(out, record_crc);
    Ok(())
}

/// Rebuild the cache tree below directory `i` from the directory records.
fn build_tree(records: &[DirectoryRecord], kids: &[Vec<usize>], i: usize) -> CacheTreeNode {
    let mut node = records[i].tree_node();
    node.children = kids[i]
        .iter()
        .map(|&c| build_tree(records, kids, c))
        .collect();
    node
}

/// Result of decoding a contiguous run of directory records.
#[derive(Debug, Default)]
pub(crate) struct DecodedDirs {
    pub(crate) entries: Vec<IndexEntry>,
    pub(crate) resolve_undo: Vec<(BString, ResolveUndoInfo)>,
    /// Child indices per record, in record order.
    pub(crate) children: Vec<Vec<usize>>,
}

/// Random access to the records of a v5 file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct V5Reader<'a> {
    data: &'a [u8],
    algo: HashAlgorithm,
    pub(crate) ndir: usize,
    pub(crate) nfile: usize,
    dir_block: usize,
}

impl<'a> V5Reader<'a> {
    pub(crate) fn open(data: &'a [u8], algo: HashAlgorithm) -> Result<Self, IndexError> {
        let mut r = Reader::new(data);
        let header = r.take(HEADER_SIZE - 4)?;
        if &header[..4] != SIGNATURE {
            return Err(IndexError::corrupt("bad signature"));
        }
        let stored = r.u32()?;
        if crc::crc32(header) != stored {
            return Err(IndexError::ChecksumMismatch);
        }
        let mut h = Reader::at(header, 4)?;
        let version = h.u32()?;
        if version != 5 {
            return Err(IndexError::UnsupportedVersion(version));
        }
        let ndir = h.u32()? as usize;
        let nfile = h.u32()? as usize;
        let nextensions = h.u32()?;
        if nextensions != 0 {
            return Err(bad(format!("{nextensions} extensions present")));
        }
        if ndir == 0 {
            return Err(bad("no root directory"));
        }
        let dir_block = ndir
            .checked_mul(4)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| bad("directory table exceeds file"))?;
        Ok(Self {
            data,
            algo,
            ndir,
            nfile,
            dir_block,
        })
    }

    /// Parse directory record `i` and check its CRC.
    pub(crate) fn dir_at(&self, i: usize) -> Result<DirectoryRecord, IndexError> {
        let mut table = Reader::at(self.data, HEADER_SIZE + 4 * i)?;
        let rel = table.u32()? as usize;
        let start = self.dir_block + rel;
        let mut r = Reader::at(self.data, start)?;
        let path = BString::from(r.cstr()?);
        let flags = r.u16()?;
        let foffset = r.u32()?;
        let cr = r.u32()?;
        let ncr = r.u32()?;
        let nsubtrees = r.u32()?;
        let nfiles = r.u32()?;
        let nentries = r.u32()?;
        let hash = ContentHash::from_bytes(r.take(self.algo.digest_len())?, self.algo)?;
        let end = r.pos();
        if !crc::verify(0, &self.data[start..end], r.u32()?) {
            return Err(bad(format!("CRC mismatch in directory record '{path}'")));
        }
        if !(path.is_empty() || (path.ends_with(b"/") && verify_path(&path[..path.len() - 1]))) {
            return Err(bad(format!("invalid directory name '{path}'")));
        }
        tracing::trace!(path = %path, nfiles, nsubtrees, "read directory record");
        Ok(DirectoryRecord {
            path,
            flags,
            foffset,
            cr,
            ncr,
            nsubtrees,
            nfiles,
            nentries,
            hash: (nentries != INVALID_TREE).then_some(hash),
        })
    }

    /// Records `lo..hi`, checked to be strictly ordered.
    pub(crate) fn dir_range(&self, lo: usize, hi: usize) -> Result<Vec<DirectoryRecord>, IndexError> {
        let mut records: Vec<DirectoryRecord> = Vec::with_capacity(hi.saturating_sub(lo));
        for i in lo..hi {
            let record = self.dir_at(i)?;
            if let Some(prev) = records.last() {
                if prev.path >= record.path {
                    return Err(bad(format!("directory '{}' out of order", record.path)));
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Index of the directory record for `key` (`path/`, or empty for root).
    pub(crate) fn find_dir(&self, key: &[u8]) -> Result<Option<usize>, IndexError> {
        let (mut lo, mut hi) = (0, self.ndir);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.dir_at(mid)?.path.as_slice().cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }

    /// First record after `start` that does not lie under `key`.
    pub(crate) fn subtree_end(&self, start: usize, key: &[u8]) -> Result<usize, IndexError> {
        let (mut lo, mut hi) = (start + 1, self.ndir);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.dir_at(mid)?.path.starts_with(key) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn files_of(&self, dir: &DirectoryRecord) -> Result<Vec<IndexEntry>, IndexError> {
        let mut out = Vec::with_capacity((dir.nfiles as usize).min(self.nfile));
        for j in 0..dir.nfiles as usize {
            let slot = dir.foffset as usize + 4 * j;
            let mut table = Reader::at(self.data, slot)?;
            let slot_bytes = table.take(4)?;
            let offset = u32::from_be_bytes([slot_bytes[0], slot_bytes[1], slot_bytes[2], slot_bytes[3]]);
            out.push(self.file_at(&dir.path, offset as usize, crc::crc32(slot_bytes))?);
        }
        Ok(out)
    }

    fn file_at(&self, dir: &[u8], start: usize, seed: u32) -> Result<IndexEntry, IndexError> {
        let mut r = Reader::at(self.data, start)?;
        let name = r.cstr()?;
        let flags = r.u16()?;
        let mode = r.u16()?;
        let mtime = Timestamp::new(r.u32()?, r.u32()?);
        let stat_crc = r.u32()?;
        let hash = ContentHash::from_bytes(r.take(self.algo.digest_len())?, self.algo)?;
        let end = r.pos();

        let mut path = BString::from(dir);
        path.extend_from_slice(name);
        if !crc::verify(seed, &self.data[start..end], r.u32()?) {
            return Err(bad(format!("CRC mismatch in file record '{path}'")));
        }
        if flags & !FILE_KNOWN != 0 {
            return Err(bad(format!("unknown flags {flags:#06x} on '{path}'")));
        }
        if name.contains(&b'/') || !verify_path(&path) {
            return Err(bad(format!("invalid path '{path}'")));
        }

        let mut entry_flags = EntryFlags::empty();
        if flags & FILE_VALID != 0 {
            entry_flags |= EntryFlags::VALID;
        }
        if flags & FILE_SKIP_WORKTREE != 0 {
            entry_flags |= EntryFlags::SKIP_WORKTREE;
        }
        if flags & FILE_INTENT_TO_ADD != 0 {
            entry_flags |= EntryFlags::INTENT_TO_ADD;
        }
        tracing::trace!(path = %path, "read file record");
        Ok(IndexEntry {
            path,
            hash,
            mode: FileMode::from_raw(u32::from(mode)),
            stage: Stage::from_u8(((flags & FILE_STAGE_MASK) >> FILE_STAGE_SHIFT) as u8)?,
            stat: StatInfo::Compact {
                mtime,
                crc: stat_crc,
            },
            flags: entry_flags,
        })
    }

    fn conflicts_of(
        &self,
        dir: &DirectoryRecord,
    ) -> Result<Vec<(BString, ResolveUndoInfo)>, IndexError> {
        let mut r = Reader::at(self.data, dir.cr as usize)?;
        let mut out = Vec::new();
        for _ in 0..dir.ncr {
            let start = r.pos();
            let mut path = BString::from(dir.path.as_slice());
            path.extend_from_slice(r.cstr()?);
            let nparts = r.u32()?;
            if nparts > 3 {
                return Err(bad(format!("{nparts} conflict parts for '{path}'")));
            }
            let mut info = ResolveUndoInfo::empty(self.algo);
            for _ in 0..nparts {
                let flags = r.u16()?;
                let mode = r.u16()?;
                let hash = ContentHash::from_bytes(r.take(self.algo.digest_len())?, self.algo)?;
                let stage = match flags >> 1 {
                    n @ 1..=3 if flags & 1 == 0 => Stage::from_u8(n as u8)?,
                    _ => return Err(bad(format!("bad conflict part flags on '{path}'"))),
                };
                info.set_stage(stage, u32::from(mode), hash);
            }
            let end = r.pos();
            if !crc::verify(0, &self.data[start..end], r.u32()?) {
                return Err(bad(format!("CRC mismatch in conflict record '{path}'")));
            }
            if !verify_path(&path) {
                return Err(bad(format!("invalid path '{path}'")));
            }
            out.push((path, info));
        }
        Ok(out)
    }

    /// Decode the entries of `records`, which must form one subtree rooted
    /// at `records[0]`, in index order.
    pub(crate) fn decode_dirs(&self, records: &[DirectoryRecord]) -> Result<DecodedDirs, IndexError> {
        let mut kids: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
        for (i, record) in records.iter().enumerate().skip(1) {
            let parent = parent_of(&record.path)
                .and_then(|p| records[..i].binary_search_by(|r| r.path.as_slice().cmp(p)).ok())
                .ok_or_else(|| bad(format!("directory '{}' has no parent", record.path)))?;
            kids[parent].push(i);
        }
        for (record, k) in records.iter().zip(&kids) {
            if record.nsubtrees as usize != k.len() {
                return Err(bad(format!(
                    "directory '{}' claims {} subtrees, found {}",
                    record.path,
                    record.nsubtrees,
                    k.len()
                )));
            }
        }

        let mut decoded = DecodedDirs::default();
        if !records.is_empty() {
            self.emit(records, &kids, 0, &mut decoded.entries)?;
        }
        for record in records {
            decoded.resolve_undo.extend(self.conflicts_of(record)?);
        }
        decoded.resolve_undo.sort_by(|a, b| a.0.cmp(&b.0));
        decoded.children = kids;
        Ok(decoded)
    }

    /// Interleave a directory's files with its subdirectories in path order.
    fn emit(
        &self,
        records: &[DirectoryRecord],
        kids: &[Vec<usize>],
        i: usize,
        out: &mut Vec<IndexEntry>,
    ) -> Result<(), IndexError> {
        let files = self.files_of(&records[i])?;
        let mut subdirs = kids[i].iter().copied().peekable();
        for file in files {
            while let Some(&d) = subdirs.peek() {
                if records[d].path.as_slice() < file.path.as_slice() {
                    self.emit(records, kids, d, out)?;
                    subdirs.next();
                } else {
                    break;
                }
            }
            out.push(file);
        }
        for d in subdirs {
            self.emit(records, kids, d, out)?;
        }
        Ok(())
    }
}

impl DirectoryRecord {
    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }
}
