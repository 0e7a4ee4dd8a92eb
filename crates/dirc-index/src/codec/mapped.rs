//! Memory-mapped index file that can be decoded partially.

use std::fs::File;
use std::path::{Path, PathBuf};

use bstr::{BStr, ByteSlice};
use dirc_hash::HashAlgorithm;
use memmap2::Mmap;

use super::v5::{DirectoryRecord, V5Reader};
use crate::config::IndexConfig;
use crate::state::IndexState;
use crate::IndexError;

/// An index file mapped read-only.
///
/// The mapping is a private snapshot; writers replace the file by rename
/// and never touch mapped bytes. For version 5 files, [`load_filtered`]
/// decodes one directory subtree without reading the rest.
///
/// [`load_filtered`]: MappedIndex::load_filtered
pub struct MappedIndex {
    path: PathBuf,
    data: Mmap,
    version: u32,
    config: IndexConfig,
}

impl MappedIndex {
    /// Map `path` and check its header.
    pub fn open(path: impl AsRef<Path>, config: &IndexConfig) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };
        let version = super::read_header(&data)?;
        if version == 5 {
            V5Reader::open(&data, config.hash_algorithm)?;
        }
        tracing::debug!(path = %path.display(), version, bytes = data.len(), "mapped index");
        Ok(Self {
            path,
            data,
            version,
            config: config.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.config.hash_algorithm
    }

    /// Decode the whole file.
    pub fn load(&self) -> Result<IndexState, IndexError> {
        IndexState::decode(&self.data, &self.config)
    }

    /// Entries (and resolve-undo records) under directory `prefix`.
    ///
    /// A trailing `/` on `prefix` is optional; an empty prefix loads
    /// everything. The result carries no cache tree.
    pub fn load_filtered(&self, prefix: &BStr) -> Result<IndexState, IndexError> {
        let dir = prefix.strip_suffix(b"/").unwrap_or(prefix);
        if dir.is_empty() {
            return self.load();
        }
        let mut key = dir.to_vec();
        key.push(b'/');

        if self.version != 5 {
            let mut state = self.load()?;
            state.set_cache_tree(None);
            state.retain_under(&key);
            return Ok(state);
        }

        let algo = self.config.hash_algorithm;
        let reader = V5Reader::open(&self.data, algo)?;
        let Some(start) = reader.find_dir(&key)? else {
            tracing::debug!(prefix = %dir.as_bstr(), "directory not in index");
            return Ok(IndexState::with_config(&self.config));
        };
        let end = reader.subtree_end(start, &key)?;
        let records = reader.dir_range(start, end)?;
        let decoded = reader.decode_dirs(&records)?;
        tracing::debug!(
            prefix = %dir.as_bstr(),
            directories = records.len(),
            entries = decoded.entries.len(),
            "partially decoded v5 index"
        );
        let mut state = IndexState::from_parts(5, algo, decoded.entries, None, decoded.resolve_undo)?;
        state.resolve_undo_mode = self.config.resolve_undo_mode;
        if self.config.resolve_undo_mode == crate::ResolveUndoMode::InIndex {
            state.migrate_to_inline();
        }
        Ok(state)
    }

    /// Every directory record of a version 5 file, in stored order.
    pub fn directories(&self) -> Result<Vec<DirectoryRecord>, IndexError> {
        if self.version != 5 {
            return Err(IndexError::UnsupportedVersion(self.version));
        }
        let reader = V5Reader::open(&self.data, self.config.hash_algorithm)?;
        reader.dir_range(0, reader.ndir)
    }
}

impl std::fmt::Debug for MappedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedIndex")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use dirc_hash::ContentHash;

    use super::*;
    use crate::entry::{FileMode, IndexEntry};
    use crate::resolve_undo::ResolveUndoInfo;
    use crate::state::InsertOptions;
    use crate::Stage;

    fn sample() -> IndexState {
        let mut state = IndexState::default();
        for (i, p) in ["a/b/c", "a/d", "ab/e", "b", "a/b/z/y"].iter().enumerate() {
            let e = IndexEntry::new(*p, FileMode::Regular, ContentHash::Sha1([i as u8 + 1; 20]), Stage::Normal)
                .unwrap();
            state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
        }
        let mut info = ResolveUndoInfo::empty(HashAlgorithm::Sha1);
        info.set_stage(Stage::Ours, 0o100644, ContentHash::Sha1([9; 20]));
        state.restore_resolve_undo(b"a/b/old", info);
        state
    }

    fn paths(state: &IndexState) -> Vec<String> {
        state.entries().map(|e| e.path.to_string()).collect()
    }

    fn written(version: u32) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let config = IndexConfig::default().with_version(version);
        let mut state = sample();
        state.set_version(version);
        state.write(&path, &config, None).unwrap();
        (dir, path)
    }

    #[test]
    fn filtered_load_reads_one_subtree() {
        for version in [2, 4, 5] {
            let (_dir, path) = written(version);
            let mapped = MappedIndex::open(&path, &IndexConfig::default()).unwrap();
            assert_eq!(mapped.version(), version);

            let sub = mapped.load_filtered(BStr::new("a/b")).unwrap();
            assert_eq!(paths(&sub), ["a/b/c", "a/b/z/y"], "version {version}");
            assert!(sub.resolve_undo_lookup(BStr::new("a/b/old")).is_some());

            let trailing = mapped.load_filtered(BStr::new("a/")).unwrap();
            assert_eq!(paths(&trailing), ["a/b/c", "a/b/z/y", "a/d"]);

            assert!(mapped.load_filtered(BStr::new("nope")).unwrap().is_empty());
            assert_eq!(mapped.load_filtered(BStr::new("")).unwrap().len(), 5);
        }
    }

    #[test]
    fn directory_dump_is_v5_only() {
        let (_dir, path) = written(5);
        let mapped = MappedIndex::open(&path, &IndexConfig::default()).unwrap();
        let dirs: Vec<String> = mapped
            .directories()
            .unwrap()
            .iter()
            .map(|d| d.path.to_string())
            .collect();
        assert_eq!(dirs, ["", "a/", "a/b/", "a/b/z/", "ab/"]);

        let (_dir2, path2) = written(2);
        let mapped = MappedIndex::open(&path2, &IndexConfig::default()).unwrap();
        assert!(matches!(mapped.directories(), Err(IndexError::UnsupportedVersion(2))));
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        std::fs::write(&path, b"not an index at all").unwrap();
        assert!(MappedIndex::open(&path, &IndexConfig::default()).is_err());
    }
}
