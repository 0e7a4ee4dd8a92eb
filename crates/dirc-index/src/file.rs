//! Loading and storing the index file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use dirc_utils::lockfile::LockFile;
use memmap2::Mmap;

use crate::codec::{self, ArrayCodec, IndexCodec, TreeCodec};
use crate::config::IndexConfig;
use crate::entry::EntryFlags;
use crate::resolve_undo::ResolveUndoMode;
use crate::stat::{ContentCheck, FileStat, StatOracle};
use crate::state::IndexState;
use crate::IndexError;

const HEADER_LEN: usize = 12;

impl IndexState {
    /// Read the index at `path`.
    ///
    /// A missing file is an empty index. The file's mtime becomes the
    /// state's timestamp for racy-clean detection.
    pub fn load(path: impl AsRef<Path>, config: &IndexConfig) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no index file; starting empty");
                return Ok(Self::with_config(config));
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        if (meta.len() as usize) < HEADER_LEN + config.hash_algorithm.digest_len() {
            return Err(IndexError::corrupt("index file smaller than expected"));
        }
        let data = unsafe { Mmap::map(&file)? };
        let mut state = Self::decode(&data, config)?;
        state.timestamp = Some(FileStat::from_metadata(&meta).mtime);
        tracing::debug!(
            path = %path.display(),
            version = ?state.version,
            entries = state.len(),
            "loaded index"
        );
        Ok(state)
    }

    /// Decode an in-memory index image.
    pub fn decode(data: &[u8], config: &IndexConfig) -> Result<Self, IndexError> {
        let version = codec::read_header(data)?;
        let mut state = if version == 5 {
            TreeCodec.decode(data, config.hash_algorithm)?
        } else {
            ArrayCodec::new(version)
                .skip_checksum(config.skip_hash_check)
                .decode(data, config.hash_algorithm)?
        };
        state.resolve_undo_mode = config.resolve_undo_mode;
        if config.resolve_undo_mode == ResolveUndoMode::InIndex {
            state.migrate_to_inline();
        }
        state.changed = false;
        Ok(state)
    }

    /// Encode in the state's own version, or `config.version` for new states.
    pub fn encode(&self, config: &IndexConfig) -> Result<Vec<u8>, IndexError> {
        let version = self.version.unwrap_or(config.version);
        let mut out = Vec::new();
        codec::codec_for(version)?.encode(self, &mut out)?;
        Ok(out)
    }

    /// Encode into `out` without touching any file.
    pub fn write_to(&self, out: &mut impl Write, config: &IndexConfig) -> Result<(), IndexError> {
        out.write_all(&self.encode(config)?)?;
        Ok(())
    }

    /// Atomically replace the index at `path`.
    ///
    /// Racily clean entries are smudged first so a later reader cannot
    /// mistake them for clean. With a `worktree`, only entries whose content
    /// really differs are smudged; without one, every racy entry is.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        config: &IndexConfig,
        worktree: Option<&dyn ContentCheck>,
    ) -> Result<(), IndexError> {
        let lock = LockFile::acquire(path.as_ref())?;
        self.write_locked(lock, config, worktree)
    }

    /// Write only when something changed or racy entries need smudging, and
    /// only when the lock is free. Returns whether the file was written.
    pub fn update_if_able(
        &mut self,
        path: impl AsRef<Path>,
        config: &IndexConfig,
        worktree: Option<&dyn ContentCheck>,
    ) -> Result<bool, IndexError> {
        if !self.changed && !self.has_racy_timestamp(config) {
            return Ok(false);
        }
        let Some(lock) = LockFile::try_acquire(path.as_ref())? else {
            tracing::debug!(path = %path.as_ref().display(), "index locked; skipping opportunistic write");
            return Ok(false);
        };
        self.write_locked(lock, config, worktree)?;
        Ok(true)
    }

    fn write_locked(
        &mut self,
        mut lock: LockFile,
        config: &IndexConfig,
        worktree: Option<&dyn ContentCheck>,
    ) -> Result<(), IndexError> {
        self.smudge_racy_entries(config, worktree);
        let data = self.encode(config)?;
        lock.write_all(&data)?;
        let target = lock.path().to_path_buf();
        lock.commit()?;

        let meta = fs::symlink_metadata(&target)?;
        self.timestamp = Some(FileStat::from_metadata(&meta).mtime);
        self.changed = false;
        tracing::debug!(
            path = %target.display(),
            bytes = data.len(),
            entries = self.len(),
            "wrote index"
        );
        Ok(())
    }

    fn smudge_racy_entries(&mut self, config: &IndexConfig, worktree: Option<&dyn ContentCheck>) {
        let timestamp = self.timestamp;
        let racy = |e: &crate::IndexEntry| {
            !e.is_resolve_undo()
                && !e.flags.contains(EntryFlags::UPTODATE)
                && crate::stat::is_racy(timestamp, e, config.use_nsec)
        };
        match worktree {
            Some(check) => {
                let oracle = StatOracle::new(config, timestamp, check);
                for entry in self.entries.iter_mut().filter(|e| racy(&**e)) {
                    oracle.smudge_racily_clean(entry);
                }
            }
            None => {
                for entry in self.entries.iter_mut().filter(|e| racy(&**e)) {
                    tracing::debug!(path = %entry.path, "smudging racy entry");
                    entry.stat.smudge();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dirc_hash::{ContentHash, HashAlgorithm};

    use super::*;
    use crate::entry::{FileMode, IndexEntry, StatData, StatInfo, Timestamp};
    use crate::state::InsertOptions;
    use crate::Stage;

    fn entry(path: &str, n: u8, mtime: u32) -> IndexEntry {
        let mut e =
            IndexEntry::new(path, FileMode::Regular, ContentHash::Sha1([n; 20]), Stage::Normal).unwrap();
        e.stat = StatInfo::Full(StatData {
            mtime: Timestamp::new(mtime, 0),
            size: 3,
            ..StatData::default()
        });
        e
    }

    #[test]
    fn missing_file_is_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let state = IndexState::load(dir.path().join("index"), &IndexConfig::default()).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.version(), None);
        assert!(state.timestamp().is_none());
    }

    #[test]
    fn short_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        fs::write(&path, b"DIRC\0\0\0\x02").unwrap();
        assert!(matches!(
            IndexState::load(&path, &IndexConfig::default()),
            Err(IndexError::Corrupt { .. })
        ));
    }

    #[test]
    fn write_then_load_sets_timestamp_and_clears_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let config = IndexConfig::default();
        let mut state = IndexState::default();
        state.insert(entry("a", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        assert!(state.is_changed());
        state.write(&path, &config, None).unwrap();
        assert!(!state.is_changed());
        assert!(state.timestamp().is_some());
        assert!(!dir.path().join("index.lock").exists());

        let loaded = IndexState::load(&path, &config).unwrap();
        assert_eq!(loaded.version(), Some(2));
        assert_eq!(loaded.entries().collect::<Vec<_>>(), state.entries().collect::<Vec<_>>());
        assert!(!loaded.is_changed());
    }

    #[test]
    fn held_lock_blocks_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        fs::write(dir.path().join("index.lock"), b"").unwrap();
        let mut state = IndexState::default();
        state.insert(entry("a", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        assert!(matches!(
            state.write(&path, &IndexConfig::default(), None),
            Err(IndexError::Lock(_))
        ));
        assert!(!state.update_if_able(&path, &IndexConfig::default(), None).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn update_if_able_skips_clean_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut state = IndexState::default();
        assert!(!state.update_if_able(&path, &IndexConfig::default(), None).unwrap());
        assert!(!path.exists());
        state.insert(entry("a", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        assert!(state.update_if_able(&path, &IndexConfig::default(), None).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn racy_entries_are_smudged_without_worktree() {
        let mut state = IndexState::default();
        state.insert(entry("old", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        state.insert(entry("racy", 2, 20), InsertOptions::OK_TO_ADD).unwrap();
        state.timestamp = Some(Timestamp::new(20, 0));
        state.smudge_racy_entries(&IndexConfig::default(), None);
        let sizes: Vec<_> = state.entries().map(|e| e.stat.size()).collect();
        assert_eq!(sizes, [Some(3), Some(0)]);
    }

    #[test]
    fn write_to_matches_encode() {
        let mut state = IndexState::new(HashAlgorithm::Sha1);
        state.insert(entry("x", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        let config = IndexConfig::default().with_version(4);
        let mut buf = Vec::new();
        state.write_to(&mut buf, &config).unwrap();
        assert_eq!(buf, state.encode(&config).unwrap());
        assert_eq!(&buf[..8], b"DIRC\0\0\0\x04");
    }

    #[test]
    fn resolve_undo_mode_applies_on_decode() {
        let mut state = IndexState::default();
        state.insert(entry("f", 1, 5), InsertOptions::OK_TO_ADD).unwrap();
        let mut info = crate::ResolveUndoInfo::empty(HashAlgorithm::Sha1);
        info.set_stage(Stage::Theirs, 0o100644, ContentHash::Sha1([3; 20]));
        state.restore_resolve_undo(b"f", info);
        let data = state.encode(&IndexConfig::default()).unwrap();

        let config = IndexConfig::default().with_resolve_undo_mode(ResolveUndoMode::InIndex);
        let inline = IndexState::decode(&data, &config).unwrap();
        assert_eq!(inline.resolve_undo_mode(), ResolveUndoMode::InIndex);
        assert_eq!(inline.len(), 1);
        assert_eq!(inline.resolve_undo_lookup("f".into()), Some(info));
    }
}
