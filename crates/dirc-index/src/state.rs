//! In-memory index: the sorted entry array and every mutation on it.

use std::cmp::Ordering;
use std::collections::HashSet;

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};

use crate::config::IndexConfig;
use crate::entry::{verify_path, EntryFlags, FileMode, IndexEntry, StatInfo, Timestamp};
use crate::extensions::tree::CacheTree;
use crate::name::compare_positions;
use crate::resolve_undo::{ResolveUndoInfo, ResolveUndoMode, ResolveUndoStore};
use crate::stat::{ContentCheck, FileStat, MatchOptions, StatOracle};
use crate::{IndexError, Stage};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertOptions: u32 {
        /// Allow adding a (name, stage) pair that is not present yet.
        const OK_TO_ADD = 0x01;
        /// Remove entries that clash as file versus directory.
        const OK_TO_REPLACE = 0x02;
        const SKIP_DF_CHECK = 0x04;
        /// Leave an existing (name, stage) entry untouched.
        const NEW_ONLY = 0x08;
        /// Append without ordering or validity checks; the caller keeps order.
        const JUST_APPEND = 0x10;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AddFlags: u32 {
        /// Record an empty placeholder (`add --intent-to-add`).
        const INTENT = 0x01;
        /// Compute everything but leave the index untouched.
        const PRETEND = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The path was already staged with identical content and mode.
    Unchanged,
}

/// Stores blob content and returns its hash.
pub trait BlobWriter {
    fn write_blob(&mut self, data: &[u8]) -> Result<ContentHash, IndexError>;
}

impl<F> BlobWriter for F
where
    F: FnMut(&[u8]) -> Result<ContentHash, IndexError>,
{
    fn write_blob(&mut self, data: &[u8]) -> Result<ContentHash, IndexError> {
        self(data)
    }
}

/// The in-memory index.
///
/// Entries are kept sorted by (name, stage); resolve-undo pseudo-entries,
/// when present, sort right after the live entry of the same (name, stage)
/// and are skipped by every query below. Positions returned by the lookup
/// methods index the underlying array and stay valid until the next
/// mutation.
#[derive(Debug, Clone)]
pub struct IndexState {
    pub(crate) version: Option<u32>,
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) entries: Vec<IndexEntry>,
    /// Names with at least one live entry.
    pub(crate) name_hash: HashSet<BString>,
    pub(crate) cache_tree: Option<CacheTree>,
    pub(crate) resolve_undo: ResolveUndoStore,
    pub(crate) resolve_undo_mode: ResolveUndoMode,
    pub(crate) changed: bool,
    /// Mtime of the file this state was loaded from or last written to.
    pub(crate) timestamp: Option<Timestamp>,
    /// Optional extensions skipped while loading.
    pub(crate) unknown_extensions: Vec<[u8; 4]>,
}

impl Default for IndexState {
    fn default() -> Self {
        Self::new(HashAlgorithm::Sha1)
    }
}

impl IndexState {
    pub fn new(hash_algorithm: HashAlgorithm) -> Self {
        Self {
            version: None,
            hash_algorithm,
            entries: Vec::new(),
            name_hash: HashSet::new(),
            cache_tree: None,
            resolve_undo: ResolveUndoStore::None,
            resolve_undo_mode: ResolveUndoMode::Separate,
            changed: false,
            timestamp: None,
            unknown_extensions: Vec::new(),
        }
    }

    pub fn with_config(config: &IndexConfig) -> Self {
        let mut state = Self::new(config.hash_algorithm);
        state.resolve_undo_mode = config.resolve_undo_mode;
        state
    }

    /// Assemble a state from decoded parts, checking the ordering invariant.
    pub(crate) fn from_parts(
        version: u32,
        hash_algorithm: HashAlgorithm,
        entries: Vec<IndexEntry>,
        cache_tree: Option<CacheTree>,
        resolve_undo: Vec<(BString, ResolveUndoInfo)>,
    ) -> Result<Self, IndexError> {
        for pair in entries.windows(2) {
            if compare_positions(&pair[0].path, pair[0].stage, &pair[1].path, pair[1].stage)
                != Ordering::Less
            {
                return Err(IndexError::corrupt(format!(
                    "entries out of order at '{}'",
                    pair[1].path
                )));
            }
        }
        let mut state = Self::new(hash_algorithm);
        state.version = Some(version);
        state.name_hash = entries.iter().map(|e| e.path.clone()).collect();
        state.entries = entries;
        state.cache_tree = cache_tree;
        if !resolve_undo.is_empty() {
            state.resolve_undo = ResolveUndoStore::Separate(resolve_undo.into_iter().collect());
        }
        Ok(state)
    }

    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Choose the on-disk version for the next write.
    ///
    /// Versions 2 to 4 store resolve-undo data as a REUC table, so inline
    /// records are moved back into a separate table.
    pub fn set_version(&mut self, version: u32) {
        if self.version == Some(version) {
            return;
        }
        if version < 5 {
            self.migrate_to_separate();
        }
        self.version = Some(version);
        self.changed = true;
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.cache_tree.as_ref()
    }

    pub fn set_cache_tree(&mut self, tree: Option<CacheTree>) {
        self.cache_tree = tree;
        self.changed = true;
    }

    /// Optional extensions that were dropped on load.
    pub fn unknown_extensions(&self) -> &[[u8; 4]] {
        &self.unknown_extensions
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_resolve_undo()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in order.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.is_resolve_undo())
    }

    /// Entry at an array position, as returned by the lookup methods.
    pub fn entry(&self, pos: usize) -> Option<&IndexEntry> {
        self.entries.get(pos)
    }

    pub fn entry_mut(&mut self, pos: usize) -> Option<&mut IndexEntry> {
        self.entries.get_mut(pos)
    }

    /// Binary search by (name, stage, pseudo-entry tag).
    pub(crate) fn search(&self, name: &[u8], stage: Stage, undo: bool) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| {
            compare_positions(&e.path, e.stage, name, stage).then(e.is_resolve_undo().cmp(&undo))
        })
    }

    /// Position of the live (name, stage) entry, or `Err` with the position
    /// it would be inserted at.
    pub fn position_of(&self, name: &BStr, stage: Stage) -> Result<usize, usize> {
        self.search(name, stage, false)
    }

    /// [`position_of`](Self::position_of) for stage 0.
    pub fn position(&self, name: &BStr) -> Result<usize, usize> {
        self.search(name, Stage::Normal, false)
    }

    /// First array slot holding `name`, or where it would go.
    pub(crate) fn first_of_name(&self, name: &[u8]) -> usize {
        match self.search(name, Stage::Normal, false) {
            Ok(pos) | Err(pos) => pos,
        }
    }

    /// Array slots from `start` while the name stays `name`, pseudo-entries included.
    pub(crate) fn same_name_from<'a>(
        &'a self,
        name: &'a [u8],
        start: usize,
    ) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.entries[start.min(self.entries.len())..]
            .iter()
            .take_while(move |e| e.path == name)
    }

    fn has_live_named(&self, name: &[u8]) -> bool {
        self.same_name_from(name, self.first_of_name(name))
            .any(|e| !e.is_resolve_undo())
    }

    /// Bring the name set in line with the array for one name.
    pub(crate) fn sync_name_hash(&mut self, name: &[u8]) {
        if self.has_live_named(name) {
            self.name_hash.insert(BString::from(name));
        } else {
            self.name_hash.remove(name.as_bstr());
        }
    }

    pub(crate) fn invalidate_cache_tree(&mut self, path: &[u8]) {
        if let Some(tree) = self.cache_tree.as_mut() {
            tree.invalidate(path.as_bstr());
        }
    }

    fn raw_insert(&mut self, pos: usize, entry: IndexEntry) {
        if !entry.is_resolve_undo() {
            self.name_hash.insert(entry.path.clone());
        }
        self.entries.insert(pos, entry);
    }

    /// Live entry for `name`, preferring stage 0, then 2, 1 and 3.
    pub fn exists(&self, name: &BStr) -> Option<&IndexEntry> {
        if !self.name_hash.contains(name) {
            return None;
        }
        self.position_also_unmerged(name)
            .map(|pos| &self.entries[pos])
    }

    /// Position of `name` at stage 0, or of its preferred conflict stage.
    pub fn position_also_unmerged(&self, name: &BStr) -> Option<usize> {
        let start = match self.position(name) {
            Ok(pos) => return Some(pos),
            Err(pos) => pos,
        };
        let rank = |stage: Stage| match stage {
            Stage::Ours => 0,
            Stage::Base => 1,
            _ => 2,
        };
        self.same_name_from(name, start)
            .enumerate()
            .filter(|(_, e)| !e.is_resolve_undo())
            .min_by_key(|(_, e)| rank(e.stage))
            .map(|(offset, _)| start + offset)
    }

    /// True when `name` is not tracked at any stage. A trailing `/` is ignored.
    pub fn is_other(&self, name: &BStr) -> bool {
        let name = name.strip_suffix(b"/").unwrap_or(name);
        self.exists(name.as_bstr()).is_none()
    }

    pub fn unmerged(&self) -> bool {
        self.entries().any(|e| e.stage != Stage::Normal)
    }

    /// Conflicted names, each once, in order.
    pub fn conflicts(&self) -> Vec<&BStr> {
        let mut names: Vec<&BStr> = Vec::new();
        for e in self.entries().filter(|e| e.stage != Stage::Normal) {
            if names.last() != Some(&e.path()) {
                names.push(e.path());
            }
        }
        names
    }

    /// No entries and never loaded from or written to disk.
    pub fn is_unborn(&self) -> bool {
        self.is_empty() && self.timestamp.is_none()
    }

    /// Forget everything except the hash algorithm and resolve-undo mode.
    pub fn discard(&mut self) {
        let algo = self.hash_algorithm;
        let mode = self.resolve_undo_mode;
        *self = Self::new(algo);
        self.resolve_undo_mode = mode;
    }

    /// Add or replace an entry.
    ///
    /// An existing (name, stage) entry is replaced unless NEW_ONLY is given.
    /// Inserting at stage 0 drops the name's conflict stages (recording them
    /// for resolve-undo). Otherwise a new pair needs OK_TO_ADD. Unless
    /// SKIP_DF_CHECK is given, a file may not share its name with a tracked
    /// directory nor sit below a tracked file; with OK_TO_REPLACE the clashing
    /// entries are removed instead of failing with [`IndexError::Conflict`].
    pub fn insert(&mut self, entry: IndexEntry, options: InsertOptions) -> Result<(), IndexError> {
        if options.contains(InsertOptions::JUST_APPEND) {
            self.raw_insert(self.entries.len(), entry);
            self.changed = true;
            return Ok(());
        }

        self.invalidate_cache_tree(&entry.path);

        if let Ok(pos) = self.search(&entry.path, entry.stage, false) {
            if !options.contains(InsertOptions::NEW_ONLY) {
                self.replace_at(pos, entry);
            }
            return Ok(());
        }

        let mut ok_to_add = options.contains(InsertOptions::OK_TO_ADD);
        if entry.stage == Stage::Normal && self.remove_conflict_stages(&entry.path) {
            ok_to_add = true;
        }
        if !ok_to_add {
            return Err(IndexError::NotFound {
                path: entry.path,
                stage: entry.stage.as_u8(),
            });
        }

        if !verify_path(&entry.path) {
            return Err(IndexError::PathInvalid { path: entry.path });
        }

        if !options.contains(InsertOptions::SKIP_DF_CHECK)
            && self.check_file_directory_conflict(
                &entry,
                options.contains(InsertOptions::OK_TO_REPLACE),
            )
            && !options.contains(InsertOptions::OK_TO_REPLACE)
        {
            return Err(IndexError::Conflict { path: entry.path });
        }

        let pos = match self.search(&entry.path, entry.stage, false) {
            Ok(pos) | Err(pos) => pos,
        };
        self.raw_insert(pos, entry);
        self.changed = true;
        Ok(())
    }

    /// Replace the entry at `pos`, which must hold the same (name, stage).
    pub fn replace_at(&mut self, pos: usize, entry: IndexEntry) {
        self.entries[pos] = entry;
        self.changed = true;
    }

    fn remove_conflict_stages(&mut self, name: &[u8]) -> bool {
        let mut removed = false;
        let mut pos = self.first_of_name(name);
        while pos < self.entries.len() && self.entries[pos].path == name {
            let e = &self.entries[pos];
            if e.is_resolve_undo() || e.stage == Stage::Normal {
                pos += 1;
                continue;
            }
            removed = true;
            self.remove_at(pos);
        }
        removed
    }

    // Remove or report entries that clash with `entry` as file versus directory.
    fn check_file_directory_conflict(&mut self, entry: &IndexEntry, replace: bool) -> bool {
        if entry.flags.contains(EntryFlags::REMOVE) {
            return false;
        }
        let pos = match self.search(&entry.path, entry.stage, false) {
            Ok(pos) | Err(pos) => pos,
        };
        let file_clash = self.has_file_name(entry, pos, replace);
        if file_clash && !replace {
            return true;
        }
        self.has_dir_name(entry, replace) || file_clash
    }

    /// Does a live entry below `entry` (treated as a directory) exist?
    fn has_file_name(&mut self, entry: &IndexEntry, mut pos: usize, replace: bool) -> bool {
        let name = entry.path.as_bytes();
        let len = name.len();
        let mut found = false;
        while pos < self.entries.len() {
            let p = &self.entries[pos];
            // Resolve-undo records and other stages of `name` itself sort
            // between the insert point and anything below `name/`.
            if p.is_resolve_undo() || p.path == name {
                pos += 1;
                continue;
            }
            if p.path.len() <= len || !p.path.starts_with(name) {
                break;
            }
            if p.stage != entry.stage
                || p.path[len] != b'/'
                || p.flags.contains(EntryFlags::REMOVE)
            {
                pos += 1;
                continue;
            }
            found = true;
            if !replace {
                break;
            }
            self.remove_at(pos);
        }
        found
    }

    /// Does a live entry exist for one of `entry`'s leading directories?
    fn has_dir_name(&mut self, entry: &IndexEntry, replace: bool) -> bool {
        let name = entry.path.as_bytes();
        let stage = entry.stage;
        let mut found = false;
        let mut slash = name.len();

        while let Some(s) = name[..slash].rfind_byte(b'/') {
            slash = s;
            let prefix = &name[..slash];

            let scan_from = match self.search(prefix, stage, false) {
                Ok(pos) if !self.entries[pos].flags.contains(EntryFlags::REMOVE) => {
                    found = true;
                    if !replace {
                        break;
                    }
                    self.remove_at(pos);
                    continue;
                }
                Ok(pos) | Err(pos) => pos,
            };

            // Something already lives under this directory at our stage, so
            // every shorter prefix was checked when it was added.
            for p in &self.entries[scan_from..] {
                if p.is_resolve_undo() && p.path == prefix {
                    continue;
                }
                if p.path.len() <= slash || p.path[slash] != b'/' || !p.path.starts_with(prefix) {
                    break;
                }
                if !p.is_resolve_undo()
                    && p.stage == stage
                    && !p.flags.contains(EntryFlags::REMOVE)
                {
                    return found;
                }
            }
        }
        found
    }

    /// Remove the entry at `pos`, recording conflict stages for resolve-undo.
    ///
    /// Returns whether any entries remain at or after `pos`.
    pub fn remove_at(&mut self, pos: usize) -> bool {
        if pos >= self.entries.len() {
            return false;
        }
        let entry = self.entries.remove(pos);
        if !entry.is_resolve_undo() {
            self.sync_name_hash(&entry.path);
            self.record_resolve_undo(&entry);
        }
        self.changed = true;
        pos < self.entries.len()
    }

    /// Remove every stage of `name`. Returns whether anything was removed.
    pub fn remove_path(&mut self, name: &BStr) -> bool {
        self.invalidate_cache_tree(name);
        let mut pos = self.first_of_name(name);
        let mut removed = false;
        while pos < self.entries.len() && self.entries[pos].path == name.as_bytes() {
            if self.entries[pos].is_resolve_undo() {
                pos += 1;
                continue;
            }
            self.remove_at(pos);
            removed = true;
        }
        removed
    }

    /// Drop every entry flagged REMOVE in one pass.
    pub fn remove_marked(&mut self) {
        let mut removed: Vec<BString> = Vec::new();
        self.entries.retain(|e| {
            if e.flags.contains(EntryFlags::REMOVE) && !e.is_resolve_undo() {
                removed.push(e.path.clone());
                false
            } else {
                true
            }
        });
        if removed.is_empty() {
            return;
        }
        for name in &removed {
            self.invalidate_cache_tree(name);
            self.sync_name_hash(name);
        }
        self.changed = true;
    }

    /// Keep only entries and resolve-undo records whose path starts with `dir`.
    pub(crate) fn retain_under(&mut self, dir: &[u8]) {
        self.entries.retain(|e| e.path.starts_with(dir));
        self.name_hash.retain(|name| name.starts_with(dir));
        if let ResolveUndoStore::Separate(map) = &mut self.resolve_undo {
            map.retain(|path, _| path.starts_with(dir));
            if map.is_empty() {
                self.resolve_undo = ResolveUndoStore::None;
            }
        }
    }

    /// Move the entry at `pos` to `new_name`, replacing any clashing entries.
    pub fn rename_entry_at(&mut self, pos: usize, new_name: &BStr) -> Result<(), IndexError> {
        let Some(old) = self.entries.get(pos).filter(|e| !e.is_resolve_undo()) else {
            return Err(IndexError::NotFound {
                path: BString::from(format!("<position {pos}>")),
                stage: 0,
            });
        };
        if !verify_path(new_name) {
            return Err(IndexError::PathInvalid {
                path: new_name.to_owned(),
            });
        }
        let mut renamed = old.clone();
        renamed.path = new_name.to_owned();
        let old_name = old.path.clone();

        self.invalidate_cache_tree(&old_name);
        self.remove_at(pos);
        self.insert(renamed, InsertOptions::OK_TO_ADD | InsertOptions::OK_TO_REPLACE)
    }

    /// Collapse every conflicted name into a stage-0 CONFLICTED placeholder
    /// with the conflicted entry's mode and a null hash.
    ///
    /// Returns whether any conflicts existed.
    pub fn read_unmerged(&mut self) -> Result<bool, IndexError> {
        let mut any = false;
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            if e.is_resolve_undo() || e.stage == Stage::Normal {
                i += 1;
                continue;
            }
            any = true;
            let placeholder = IndexEntry {
                path: e.path.clone(),
                hash: self.hash_algorithm.null_hash(),
                mode: e.mode,
                stage: Stage::Normal,
                stat: StatInfo::default(),
                flags: EntryFlags::CONFLICTED,
            };
            let name = placeholder.path.clone();
            self.insert(placeholder, InsertOptions::SKIP_DF_CHECK)?;
            i = self.first_of_name(&name) + 1;
        }
        Ok(any)
    }

    /// Stage the file at `path` from the worktree.
    ///
    /// Unchanged files (clean stat against the staged entry) are only marked
    /// UPTODATE. Otherwise the content goes through `writer` and the entry is
    /// added or replaced, clashing entries included.
    pub fn add_path(
        &mut self,
        path: &BStr,
        st: &FileStat,
        worktree: &dyn ContentCheck,
        writer: &mut dyn BlobWriter,
        flags: AddFlags,
        config: &IndexConfig,
    ) -> Result<AddOutcome, IndexError> {
        if !(st.is_file() || st.is_symlink() || st.is_dir()) {
            return Err(IndexError::UnsupportedFileType {
                path: path.to_owned(),
            });
        }
        let name = if st.is_dir() {
            path.strip_suffix(b"/").unwrap_or(path).as_bstr()
        } else {
            path
        };
        let intent = flags.contains(AddFlags::INTENT);

        let mut entry = IndexEntry::new(
            name,
            FileMode::Regular,
            self.hash_algorithm.null_hash(),
            Stage::Normal,
        )?;
        if intent {
            entry.flags |= EntryFlags::INTENT_TO_ADD;
        } else {
            entry.fill_stat(st, config);
        }

        let existing = self.position_also_unmerged(name);
        entry.mode = if config.trust_executable_bit && config.has_symlinks {
            FileMode::from_stat_mode(st.mode)
        } else {
            FileMode::from_stat_with_existing(
                existing.map(|pos| self.entries[pos].mode),
                st.mode,
                config,
            )
        };

        let alias = existing.filter(|&pos| self.entries[pos].stage == Stage::Normal);
        if let Some(pos) = alias {
            let oracle = StatOracle::new(config, self.timestamp, worktree);
            let options = MatchOptions::IGNORE_VALID
                | MatchOptions::IGNORE_SKIP_WORKTREE
                | MatchOptions::RACY_IS_DIRTY;
            if !intent && oracle.match_stat(&self.entries[pos], st, options).is_empty() {
                let staged = &mut self.entries[pos];
                if !staged.mode.is_gitlink() {
                    staged.mark_uptodate();
                }
                staged.flags |= EntryFlags::ADDED;
                tracing::debug!(path = %name, "unchanged, not re-adding");
                return Ok(AddOutcome::Unchanged);
            }
        }

        entry.hash = if intent {
            writer.write_blob(b"")?
        } else if entry.mode.is_gitlink() {
            worktree.gitlink_head(name).ok_or_else(|| {
                IndexError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("'{name}' does not have a commit checked out"),
                ))
            })?
        } else {
            let data = worktree.read_content(name, st)?;
            writer.write_blob(&data)?
        };
        entry.flags |= EntryFlags::ADDED;

        let unchanged = alias.is_some_and(|pos| {
            let staged = &self.entries[pos];
            staged.hash == entry.hash && staged.mode == entry.mode
        });

        if !flags.contains(AddFlags::PRETEND) {
            let mut options = InsertOptions::OK_TO_ADD | InsertOptions::OK_TO_REPLACE;
            if intent {
                options |= InsertOptions::NEW_ONLY;
            }
            self.insert(entry, options)?;
        }
        tracing::debug!(path = %name, unchanged, "added");
        Ok(if unchanged {
            AddOutcome::Unchanged
        } else {
            AddOutcome::Added
        })
    }

    /// Build a validated entry, optionally refreshed against the worktree.
    pub fn make_entry(
        &self,
        mode: FileMode,
        hash: ContentHash,
        path: &BStr,
        stage: Stage,
        refresh: Option<&StatOracle<'_>>,
    ) -> Result<IndexEntry, IndexError> {
        let mut entry = IndexEntry::new(path, mode, hash, stage)?;
        let Some(oracle) = refresh else {
            return Ok(entry);
        };
        match crate::refresh::refresh_one(&mut entry, MatchOptions::empty(), oracle) {
            Ok(crate::refresh::EntryRefresh::Unchanged) => Ok(entry),
            Ok(crate::refresh::EntryRefresh::Updated(updated)) => Ok(updated),
            Err(reason) => Err(IndexError::StaleEntry {
                path: path.to_owned(),
                reason,
            }),
        }
    }
}
