//! Index entry types: IndexEntry, StatInfo, EntryFlags, FileMode.

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::ContentHash;

use crate::config::IndexConfig;
use crate::stat::FileStat;
use crate::{IndexError, Stage};

/// A single entry in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the working-tree root, `/`-separated.
    pub path: BString,
    /// Hash of the blob (or commit, for gitlinks).
    pub hash: ContentHash,
    pub mode: FileMode,
    pub stage: Stage,
    /// Filesystem metadata recorded when the entry was last refreshed.
    pub stat: StatInfo,
    pub flags: EntryFlags,
}

impl IndexEntry {
    /// Build an entry with empty stat data, rejecting paths that may not be tracked.
    pub fn new(
        path: impl Into<BString>,
        mode: FileMode,
        hash: ContentHash,
        stage: Stage,
    ) -> Result<Self, IndexError> {
        let path = path.into();
        if !verify_path(&path) {
            return Err(IndexError::PathInvalid { path });
        }
        Ok(Self {
            path,
            hash,
            mode,
            stage,
            stat: StatInfo::default(),
            flags: EntryFlags::empty(),
        })
    }

    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }

    /// Record `st` as the entry's last known filesystem state.
    ///
    /// Regular files become UPTODATE. Entries that are assumed unchanged by
    /// configuration get VALID set so later comparisons skip the filesystem.
    pub fn fill_stat(&mut self, st: &FileStat, config: &IndexConfig) {
        self.stat = match self.stat {
            StatInfo::Full(_) => StatInfo::Full(StatData::from_file_stat(st)),
            StatInfo::Compact { .. } => StatData::from_file_stat(st).to_compact(),
        };
        if config.assume_unchanged {
            self.flags |= EntryFlags::VALID;
        }
        if st.is_file() {
            self.mark_uptodate();
        }
    }

    /// True for pseudo-entries carrying resolve-undo data inside the entry array.
    pub fn is_resolve_undo(&self) -> bool {
        self.flags.contains(EntryFlags::RESOLVE_UNDO)
    }

    /// Whether the v3 extended flag word is needed to store this entry.
    pub fn needs_extended(&self) -> bool {
        self.flags.intersects(EntryFlags::EXTENDED)
    }

    pub fn mark_uptodate(&mut self) {
        self.flags |= EntryFlags::UPTODATE;
    }

    pub fn is_uptodate(&self) -> bool {
        self.flags.contains(EntryFlags::UPTODATE)
    }
}

/// Modification or change time, seconds and nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub nsecs: u32,
}

impl Timestamp {
    pub const fn new(secs: u32, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.nsecs == 0
    }
}

/// Full stat record, as stored by formats 2 to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatData {
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    /// File size truncated to 32 bits.
    pub size: u32,
}

impl StatData {
    pub fn from_file_stat(st: &FileStat) -> Self {
        Self {
            ctime: st.ctime,
            mtime: st.mtime,
            dev: st.dev,
            ino: st.ino,
            uid: st.uid,
            gid: st.gid,
            size: st.size as u32,
        }
    }

    /// CRC32 over the fields the compact encoding does not store inline.
    pub fn compact_crc(&self) -> u32 {
        dirc_utils::crc::crc32_of_words(&[
            self.ctime.secs,
            self.ctime.nsecs,
            self.ino,
            self.size,
            self.dev,
            self.uid,
            self.gid,
        ])
    }

    pub fn to_compact(&self) -> StatInfo {
        StatInfo::Compact {
            mtime: self.mtime,
            crc: self.compact_crc(),
        }
    }
}

/// Stat information in one of the two encodings an entry can carry.
///
/// Formats 2 to 4 keep every field; format 5 keeps only mtime and a CRC
/// over the rest. The stat oracle compares whichever one is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatInfo {
    Full(StatData),
    Compact { mtime: Timestamp, crc: u32 },
}

impl Default for StatInfo {
    fn default() -> Self {
        StatInfo::Full(StatData::default())
    }
}

impl StatInfo {
    pub fn mtime(&self) -> Timestamp {
        match self {
            StatInfo::Full(sd) => sd.mtime,
            StatInfo::Compact { mtime, .. } => *mtime,
        }
    }

    /// Recorded size; unknown for the compact encoding.
    pub fn size(&self) -> Option<u32> {
        match self {
            StatInfo::Full(sd) => Some(sd.size),
            StatInfo::Compact { .. } => None,
        }
    }

    pub fn to_compact(&self) -> StatInfo {
        match self {
            StatInfo::Full(sd) => sd.to_compact(),
            compact => *compact,
        }
    }

    /// Force the next comparison to look at content: zero the size (full)
    /// or the mtime (compact).
    pub fn smudge(&mut self) {
        match self {
            StatInfo::Full(sd) => sd.size = 0,
            StatInfo::Compact { mtime, .. } => *mtime = Timestamp::default(),
        }
    }
}

bitflags::bitflags! {
    /// Per-entry flags. Only VALID, INTENT_TO_ADD and SKIP_WORKTREE reach disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u32 {
        /// Assume unchanged; the worktree is not consulted.
        const VALID = 1 << 0;
        /// Placeholder recorded by `add --intent-to-add`.
        const INTENT_TO_ADD = 1 << 1;
        const SKIP_WORKTREE = 1 << 2;
        /// Verified clean against the worktree during this session.
        const UPTODATE = 1 << 3;
        /// Marked for deletion by the next `remove_marked`.
        const REMOVE = 1 << 4;
        const ADDED = 1 << 5;
        /// Stage-0 placeholder produced by `read_unmerged`.
        const CONFLICTED = 1 << 6;
        /// Pseudo-entry holding one stage of resolve-undo data.
        const RESOLVE_UNDO = 1 << 7;

        const EXTENDED = Self::INTENT_TO_ADD.bits() | Self::SKIP_WORKTREE.bits();
        const PERSISTENT = Self::VALID.bits() | Self::EXTENDED.bits();
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFGITLINK: u32 = 0o160000;

/// Tracked file modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// 100644
    Regular,
    /// 100755
    Executable,
    /// 120000
    Symlink,
    /// 160000
    Gitlink,
    /// 040000, only in trees
    Tree,
    /// Anything else read from disk.
    Unknown(u32),
}

impl FileMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0o100644 => FileMode::Regular,
            0o100755 => FileMode::Executable,
            0o120000 => FileMode::Symlink,
            0o160000 => FileMode::Gitlink,
            0o040000 => FileMode::Tree,
            other => FileMode::Unknown(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            FileMode::Regular => 0o100644,
            FileMode::Executable => 0o100755,
            FileMode::Symlink => 0o120000,
            FileMode::Gitlink => 0o160000,
            FileMode::Tree => 0o040000,
            FileMode::Unknown(raw) => *raw,
        }
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, FileMode::Regular | FileMode::Executable)
    }

    pub fn is_symlink(&self) -> bool {
        *self == FileMode::Symlink
    }

    pub fn is_gitlink(&self) -> bool {
        *self == FileMode::Gitlink
    }

    /// Sorts as a directory in tree order.
    pub fn is_dir_like(&self) -> bool {
        matches!(self, FileMode::Tree | FileMode::Gitlink)
            || self.raw() & S_IFMT == S_IFDIR
    }

    /// Canonical mode for a filesystem `st_mode`: symlinks and directories
    /// keep their type, files become 644 or 755 by the owner exec bit.
    pub fn from_stat_mode(st_mode: u32) -> Self {
        match st_mode & S_IFMT {
            S_IFLNK => FileMode::Symlink,
            S_IFDIR | S_IFGITLINK => FileMode::Gitlink,
            _ if st_mode & 0o100 != 0 => FileMode::Executable,
            _ => FileMode::Regular,
        }
    }

    /// Mode for a file being (re)added, honouring filesystems that cannot
    /// represent the exec bit or symlinks by keeping what `existing` had.
    pub fn from_stat_with_existing(
        existing: Option<FileMode>,
        st_mode: u32,
        config: &IndexConfig,
    ) -> Self {
        let is_reg = st_mode & S_IFMT == S_IFREG;
        if !config.has_symlinks && is_reg {
            if let Some(FileMode::Symlink) = existing {
                return FileMode::Symlink;
            }
        }
        if !config.trust_executable_bit && is_reg {
            return match existing {
                Some(mode) if mode.is_regular() => mode,
                _ => FileMode::Regular,
            };
        }
        Self::from_stat_mode(st_mode)
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06o}", self.raw())
    }
}

/// Whether `path` may be stored in the index.
///
/// Rejects empty and absolute paths, empty components (`a//b`, trailing
/// `/`) and any component equal to `.`, `..` or `.git` (the last one
/// case-insensitively).
pub fn verify_path(path: &[u8]) -> bool {
    if path.is_empty() {
        return false;
    }
    path.split(|&b| b == b'/').all(|component| {
        !component.is_empty()
            && component != b"."
            && component != b".."
            && !component.eq_ignore_ascii_case(b".git")
    })
}
