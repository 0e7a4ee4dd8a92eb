//! Stat oracle: decide from cached metadata whether an entry may have changed.
//!
//! A cheap `lstat` comparison settles the common case. When the file was
//! modified in the same timestamp granule as the index was written ("racily
//! clean"), stat equality proves nothing and the content is re-hashed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bstr::{BStr, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};

use crate::config::IndexConfig;
use crate::entry::{EntryFlags, FileMode, IndexEntry, StatInfo, Timestamp};

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// The parts of an `lstat` result the index cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    /// Raw `st_mode`, file type bits included.
    pub mode: u32,
    pub ctime: Timestamp,
    pub mtime: Timestamp,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl FileStat {
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode(),
            ctime: Timestamp::new(meta.ctime() as u32, meta.ctime_nsec() as u32),
            mtime: Timestamp::new(meta.mtime() as u32, meta.mtime_nsec() as u32),
            dev: meta.dev() as u32,
            ino: meta.ino() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::time::UNIX_EPOCH;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        let ts = Timestamp::new(mtime.as_secs() as u32, mtime.subsec_nanos());
        let ftype = meta.file_type();
        let mode = if ftype.is_symlink() {
            S_IFLNK | 0o777
        } else if ftype.is_dir() {
            S_IFDIR | 0o755
        } else {
            S_IFREG | 0o644
        };
        Self {
            mode,
            ctime: ts,
            mtime: ts,
            size: meta.len(),
            ..Self::default()
        }
    }

    /// `lstat` a path.
    pub fn lstat(path: impl AsRef<Path>) -> io::Result<Self> {
        fs::symlink_metadata(path).map(|m| Self::from_metadata(&m))
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// CRC over the fields a compact stat record folds together.
    pub fn compact_crc(&self) -> u32 {
        crate::entry::StatData::from_file_stat(self).compact_crc()
    }
}

bitflags::bitflags! {
    /// What differs between an entry and the filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChangeBits: u32 {
        const MTIME_CHANGED = 0x0001;
        const CTIME_CHANGED = 0x0002;
        const OWNER_CHANGED = 0x0004;
        const MODE_CHANGED = 0x0008;
        const INODE_CHANGED = 0x0010;
        const DATA_CHANGED = 0x0020;
        const TYPE_CHANGED = 0x0040;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchOptions: u32 {
        /// Compare even when the entry is marked VALID.
        const IGNORE_VALID = 0x01;
        /// A racily clean entry counts as modified without hashing.
        const RACY_IS_DIRTY = 0x02;
        /// Compare even when the entry is marked SKIP_WORKTREE.
        const IGNORE_SKIP_WORKTREE = 0x04;
    }
}

/// Worktree access needed to verify entries: `lstat` and content comparison.
pub trait ContentCheck {
    fn lstat(&self, path: &BStr) -> io::Result<FileStat>;

    /// Does the regular file at `path` hash to `expected`?
    fn blob_matches(&self, path: &BStr, expected: &ContentHash) -> bool;

    /// Does the symlink target at `path` hash to `expected`?
    fn link_matches(&self, path: &BStr, expected: &ContentHash) -> bool;

    /// Current HEAD of the submodule checked out at `path`, if readable.
    fn gitlink_head(&self, _path: &BStr) -> Option<ContentHash> {
        None
    }

    /// An unreadable submodule HEAD counts as a match.
    fn gitlink_matches(&self, path: &BStr, expected: &ContentHash) -> bool {
        match self.gitlink_head(path) {
            Some(head) => head == *expected,
            None => true,
        }
    }

    /// Bytes to store for `path`: file content, or the link target for symlinks.
    fn read_content(&self, path: &BStr, st: &FileStat) -> io::Result<Vec<u8>>;
}

/// A checked-out working tree on the local filesystem.
#[derive(Debug, Clone)]
pub struct Worktree {
    root: PathBuf,
    algo: HashAlgorithm,
}

impl Worktree {
    pub fn new(root: impl Into<PathBuf>, algo: HashAlgorithm) -> Self {
        Self {
            root: root.into(),
            algo,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &BStr) -> io::Result<PathBuf> {
        let rel = path
            .to_path()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(self.root.join(rel))
    }
}

impl ContentCheck for Worktree {
    fn lstat(&self, path: &BStr) -> io::Result<FileStat> {
        FileStat::lstat(self.full_path(path)?)
    }

    fn blob_matches(&self, path: &BStr, expected: &ContentHash) -> bool {
        let Ok(full) = self.full_path(path) else {
            return false;
        };
        match dirc_hash::hash_file(self.algo, &full) {
            Ok(hash) => hash == *expected,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "cannot hash worktree file");
                false
            }
        }
    }

    fn link_matches(&self, path: &BStr, expected: &ContentHash) -> bool {
        let target = match self.full_path(path).and_then(fs::read_link) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let bytes = <[u8]>::from_path(&target).map(|b| b.to_vec());
        match bytes {
            Some(b) => dirc_hash::hash_blob(self.algo, &b).is_ok_and(|h| h == *expected),
            None => false,
        }
    }

    fn gitlink_head(&self, path: &BStr) -> Option<ContentHash> {
        let dotgit = self.full_path(path).ok()?.join(".git");
        let gitdir = if dotgit.is_file() {
            let content = fs::read_to_string(&dotgit).ok()?;
            let dir = content.trim().strip_prefix("gitdir:")?.trim().to_string();
            let dir = PathBuf::from(dir);
            if dir.is_absolute() {
                dir
            } else {
                dotgit.parent()?.join(dir)
            }
        } else {
            dotgit
        };
        let head = fs::read_to_string(gitdir.join("HEAD")).ok()?;
        let head = head.trim();
        let hex = match head.strip_prefix("ref:") {
            Some(refname) => fs::read_to_string(gitdir.join(refname.trim())).ok()?,
            None => head.to_string(),
        };
        ContentHash::from_hex(hex.trim()).ok()
    }

    fn read_content(&self, path: &BStr, st: &FileStat) -> io::Result<Vec<u8>> {
        let full = self.full_path(path)?;
        if st.is_symlink() {
            let target = fs::read_link(&full)?;
            <[u8]>::from_path(&target)
                .map(|b| b.to_vec())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 link target"))
        } else {
            fs::read(&full)
        }
    }
}

pub(crate) fn is_racy(timestamp: Option<Timestamp>, entry: &IndexEntry, use_nsec: bool) -> bool {
    let Some(ts) = timestamp else {
        return false;
    };
    if entry.mode.is_gitlink() || ts.secs == 0 {
        return false;
    }
    let mtime = entry.stat.mtime();
    if use_nsec {
        ts.secs < mtime.secs || (ts.secs == mtime.secs && ts.nsecs <= mtime.nsecs)
    } else {
        ts.secs <= mtime.secs
    }
}

/// Compares entries against the filesystem under one configuration.
///
/// `timestamp` is the mtime of the index file the entries came from; entries
/// modified at or after it are racily clean.
pub struct StatOracle<'a> {
    pub config: &'a IndexConfig,
    pub timestamp: Option<Timestamp>,
    pub check: &'a dyn ContentCheck,
}

impl<'a> StatOracle<'a> {
    pub fn new(
        config: &'a IndexConfig,
        timestamp: Option<Timestamp>,
        check: &'a dyn ContentCheck,
    ) -> Self {
        Self {
            config,
            timestamp,
            check,
        }
    }

    /// Type/mode check plus the stat comparison for the entry's encoding.
    pub fn match_stat_basic(&self, entry: &IndexEntry, st: &FileStat) -> ChangeBits {
        if entry.flags.contains(EntryFlags::REMOVE) {
            return ChangeBits::MODE_CHANGED | ChangeBits::DATA_CHANGED | ChangeBits::TYPE_CHANGED;
        }

        let mut changed = ChangeBits::empty();
        match entry.mode {
            FileMode::Regular | FileMode::Executable => {
                if !st.is_file() {
                    changed |= ChangeBits::TYPE_CHANGED;
                }
                if self.config.trust_executable_bit && (entry.mode.raw() ^ st.mode) & 0o100 != 0 {
                    changed |= ChangeBits::MODE_CHANGED;
                }
            }
            FileMode::Symlink => {
                if !st.is_symlink() && (self.config.has_symlinks || !st.is_file()) {
                    changed |= ChangeBits::TYPE_CHANGED;
                }
            }
            FileMode::Gitlink => {
                // Only the checked-out HEAD matters for a submodule.
                if !st.is_dir() {
                    changed |= ChangeBits::TYPE_CHANGED;
                } else if !self.check.gitlink_matches(entry.path(), &entry.hash) {
                    changed |= ChangeBits::DATA_CHANGED;
                }
                return changed;
            }
            FileMode::Tree | FileMode::Unknown(_) => {
                tracing::warn!(path = %entry.path, mode = %entry.mode, "unexpected entry mode");
                return changed | ChangeBits::TYPE_CHANGED;
            }
        }

        changed | self.compare_stat(entry, st)
    }

    fn compare_stat(&self, entry: &IndexEntry, st: &FileStat) -> ChangeBits {
        let mut changed = ChangeBits::empty();
        match &entry.stat {
            StatInfo::Full(sd) => {
                if sd.mtime.secs != st.mtime.secs {
                    changed |= ChangeBits::MTIME_CHANGED;
                }
                if self.config.trust_ctime && sd.ctime.secs != st.ctime.secs {
                    changed |= ChangeBits::CTIME_CHANGED;
                }
                if self.config.use_nsec {
                    if sd.mtime.nsecs != st.mtime.nsecs {
                        changed |= ChangeBits::MTIME_CHANGED;
                    }
                    if self.config.trust_ctime && sd.ctime.nsecs != st.ctime.nsecs {
                        changed |= ChangeBits::CTIME_CHANGED;
                    }
                }
                if sd.uid != st.uid || sd.gid != st.gid {
                    changed |= ChangeBits::OWNER_CHANGED;
                }
                if sd.ino != st.ino {
                    changed |= ChangeBits::INODE_CHANGED;
                }
                if self.config.check_dev && sd.dev != st.dev {
                    changed |= ChangeBits::INODE_CHANGED;
                }
                if sd.size != st.size as u32 {
                    changed |= ChangeBits::DATA_CHANGED;
                }
                // A zero size on a non-empty blob is a smudged entry.
                if sd.size == 0 && !entry.hash.is_empty_blob() {
                    changed |= ChangeBits::DATA_CHANGED;
                }
            }
            StatInfo::Compact { mtime, crc } => {
                if mtime.secs != st.mtime.secs
                    || (self.config.use_nsec && mtime.nsecs != st.mtime.nsecs)
                {
                    changed |= ChangeBits::MTIME_CHANGED;
                }
                if *crc != st.compact_crc() {
                    changed |= ChangeBits::OWNER_CHANGED | ChangeBits::INODE_CHANGED;
                }
                // A zero mtime on a non-empty blob is a smudged entry.
                if mtime.is_zero() && !entry.hash.is_empty_blob() {
                    changed |= ChangeBits::DATA_CHANGED;
                }
            }
        }
        changed
    }

    /// Was `entry` modified in the same granule the index was written in?
    pub fn is_racy(&self, entry: &IndexEntry) -> bool {
        is_racy(self.timestamp, entry, self.config.use_nsec)
    }

    /// Full comparison of an entry with its `lstat` result.
    pub fn match_stat(&self, entry: &IndexEntry, st: &FileStat, options: MatchOptions) -> ChangeBits {
        if !options.contains(MatchOptions::IGNORE_SKIP_WORKTREE)
            && entry.flags.contains(EntryFlags::SKIP_WORKTREE)
        {
            return ChangeBits::empty();
        }
        if !options.contains(MatchOptions::IGNORE_VALID) && entry.flags.contains(EntryFlags::VALID) {
            return ChangeBits::empty();
        }
        if entry.flags.contains(EntryFlags::INTENT_TO_ADD) {
            return ChangeBits::DATA_CHANGED | ChangeBits::TYPE_CHANGED | ChangeBits::MODE_CHANGED;
        }

        let mut changed = self.match_stat_basic(entry, st);
        if changed.is_empty() && self.is_racy(entry) {
            if options.contains(MatchOptions::RACY_IS_DIRTY) {
                changed |= ChangeBits::DATA_CHANGED;
            } else {
                changed |= self.modified_content(entry, st);
            }
        }
        changed
    }

    /// Like [`match_stat`](Self::match_stat), but settles stat-only
    /// differences by looking at the content.
    pub fn modified(&self, entry: &IndexEntry, st: &FileStat, options: MatchOptions) -> ChangeBits {
        let changed = self.match_stat(entry, st, options);
        if changed.is_empty() {
            return changed;
        }
        if changed.intersects(ChangeBits::MODE_CHANGED | ChangeBits::TYPE_CHANGED) {
            return changed;
        }
        // A size difference on a non-empty entry needs no hashing to confirm.
        if changed.contains(ChangeBits::DATA_CHANGED)
            && (entry.mode.is_gitlink() || entry.stat.size().is_some_and(|s| s != 0))
        {
            return changed;
        }
        let content = self.modified_content(entry, st);
        if content.is_empty() {
            return content;
        }
        changed | content
    }

    /// Compare the entry's hash with what is on disk now.
    pub fn modified_content(&self, entry: &IndexEntry, st: &FileStat) -> ChangeBits {
        let path = entry.path();
        if st.is_file() {
            if !self.check.blob_matches(path, &entry.hash) {
                return ChangeBits::DATA_CHANGED;
            }
        } else if st.is_symlink() {
            if !self.check.link_matches(path, &entry.hash) {
                return ChangeBits::DATA_CHANGED;
            }
        } else if st.is_dir() {
            if !entry.mode.is_gitlink() {
                return ChangeBits::TYPE_CHANGED;
            }
            if !self.check.gitlink_matches(path, &entry.hash) {
                return ChangeBits::DATA_CHANGED;
            }
        } else {
            return ChangeBits::TYPE_CHANGED;
        }
        ChangeBits::empty()
    }

    /// Make a racily clean entry that really differs look dirty on disk.
    ///
    /// Only a stat match hides the change, so if stat already differs, or the
    /// content still matches, nothing is touched.
    pub fn smudge_racily_clean(&self, entry: &mut IndexEntry) {
        let Ok(st) = self.check.lstat(entry.path()) else {
            return;
        };
        if !self.match_stat_basic(entry, &st).is_empty() {
            return;
        }
        if !self.modified_content(entry, &st).is_empty() {
            tracing::debug!(path = %entry.path, "smudging racily clean entry");
            entry.stat.smudge();
        }
    }
}
