//! Resolve-undo store.
//!
//! When a conflicted path is resolved, its stage 1-3 entries are remembered
//! so the conflict can be recreated later. The data lives either in a
//! separate name-keyed map or inline in the entry array as pseudo-entries
//! tagged [`EntryFlags::RESOLVE_UNDO`]. Conversion only goes from separate
//! to inline.

use std::collections::BTreeMap;

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};

use crate::entry::{EntryFlags, FileMode, IndexEntry, StatInfo};
use crate::pathspec::PathMatch;
use crate::state::{IndexState, InsertOptions};
use crate::Stage;

/// Modes and hashes of the three conflict stages; mode 0 marks an absent stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveUndoInfo {
    pub modes: [u32; 3],
    pub hashes: [ContentHash; 3],
}

impl ResolveUndoInfo {
    pub fn empty(algo: HashAlgorithm) -> Self {
        Self {
            modes: [0; 3],
            hashes: [algo.null_hash(); 3],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modes.iter().all(|&m| m == 0)
    }

    /// Record one conflict stage (1-3).
    pub fn set_stage(&mut self, stage: Stage, mode: u32, hash: ContentHash) {
        if let Some(i) = stage_index(stage) {
            self.modes[i] = mode;
            self.hashes[i] = hash;
        }
    }

    /// Present stages as `(stage, mode, hash)`.
    pub fn stages(&self) -> impl Iterator<Item = (Stage, u32, ContentHash)> + '_ {
        Stage::CONFLICTED
            .iter()
            .enumerate()
            .filter(|(i, _)| self.modes[*i] != 0)
            .map(|(i, stage)| (*stage, self.modes[i], self.hashes[i]))
    }
}

fn stage_index(stage: Stage) -> Option<usize> {
    match stage {
        Stage::Normal => None,
        s => Some(s.as_u8() as usize - 1),
    }
}

/// Where resolve-undo data is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveUndoMode {
    #[default]
    Separate,
    InIndex,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResolveUndoStore {
    #[default]
    None,
    Separate(BTreeMap<BString, ResolveUndoInfo>),
    /// Pseudo-entries in the entry array carry the data.
    InIndex,
}

impl IndexState {
    /// Remember a conflict stage that is about to leave the index.
    pub(crate) fn record_resolve_undo(&mut self, entry: &IndexEntry) {
        if entry.stage == Stage::Normal || entry.is_resolve_undo() {
            return;
        }
        if self.resolve_undo_mode == ResolveUndoMode::InIndex {
            self.migrate_to_inline();
        }
        if matches!(self.resolve_undo, ResolveUndoStore::InIndex) {
            self.put_inline(&entry.path, entry.stage, entry.mode.raw(), entry.hash);
            return;
        }
        let algo = self.hash_algorithm;
        if matches!(self.resolve_undo, ResolveUndoStore::None) {
            self.resolve_undo = ResolveUndoStore::Separate(BTreeMap::new());
        }
        if let ResolveUndoStore::Separate(map) = &mut self.resolve_undo {
            map.entry(entry.path.clone())
                .or_insert_with(|| ResolveUndoInfo::empty(algo))
                .set_stage(entry.stage, entry.mode.raw(), entry.hash);
        }
    }

    fn put_inline(&mut self, path: &[u8], stage: Stage, mode: u32, hash: ContentHash) {
        match self.search(path, stage, true) {
            Ok(pos) => {
                let slot = &mut self.entries[pos];
                slot.mode = FileMode::from_raw(mode);
                slot.hash = hash;
            }
            Err(pos) => {
                let pseudo = IndexEntry {
                    path: BString::from(path),
                    hash,
                    mode: FileMode::from_raw(mode),
                    stage,
                    stat: StatInfo::default(),
                    flags: EntryFlags::RESOLVE_UNDO,
                };
                self.entries.insert(pos, pseudo);
            }
        }
    }

    /// Move separately stored resolve-undo data into the entry array.
    pub fn migrate_to_inline(&mut self) {
        let map = match std::mem::take(&mut self.resolve_undo) {
            ResolveUndoStore::Separate(map) => map,
            ResolveUndoStore::InIndex => {
                self.resolve_undo = ResolveUndoStore::InIndex;
                return;
            }
            ResolveUndoStore::None => BTreeMap::new(),
        };
        tracing::debug!(paths = map.len(), "moving resolve-undo data into the index");
        for (path, info) in &map {
            for (stage, mode, hash) in info.stages() {
                self.put_inline(path, stage, mode, hash);
            }
        }
        self.resolve_undo = ResolveUndoStore::InIndex;
        self.resolve_undo_mode = ResolveUndoMode::InIndex;
    }

    /// Move inline resolve-undo data back into a separate table.
    pub fn migrate_to_separate(&mut self) {
        self.resolve_undo_mode = ResolveUndoMode::Separate;
        if !matches!(self.resolve_undo, ResolveUndoStore::InIndex) {
            return;
        }
        let records = self.resolve_undo_entries();
        tracing::debug!(paths = records.len(), "moving resolve-undo data out of the index");
        self.entries.retain(|e| !e.is_resolve_undo());
        self.resolve_undo = if records.is_empty() {
            ResolveUndoStore::None
        } else {
            ResolveUndoStore::Separate(records.into_iter().collect())
        };
    }

    /// Resolve-undo data recorded for `path`, in either representation.
    pub fn resolve_undo_lookup(&self, path: &BStr) -> Option<ResolveUndoInfo> {
        match &self.resolve_undo {
            ResolveUndoStore::None => None,
            ResolveUndoStore::Separate(map) => map.get(path).copied(),
            ResolveUndoStore::InIndex => {
                let mut info = ResolveUndoInfo::empty(self.hash_algorithm);
                for e in self.same_name_from(path, self.first_of_name(path)) {
                    if e.is_resolve_undo() {
                        info.set_stage(e.stage, e.mode.raw(), e.hash);
                    }
                }
                (!info.is_empty()).then_some(info)
            }
        }
    }

    /// All resolve-undo records in name order.
    pub fn resolve_undo_entries(&self) -> Vec<(BString, ResolveUndoInfo)> {
        match &self.resolve_undo {
            ResolveUndoStore::None => Vec::new(),
            ResolveUndoStore::Separate(map) => {
                map.iter().map(|(k, v)| (k.clone(), *v)).collect()
            }
            ResolveUndoStore::InIndex => {
                let mut out: Vec<(BString, ResolveUndoInfo)> = Vec::new();
                for e in self.entries.iter().filter(|e| e.is_resolve_undo()) {
                    match out.last_mut() {
                        Some((name, info)) if *name == e.path => {
                            info.set_stage(e.stage, e.mode.raw(), e.hash)
                        }
                        _ => {
                            let mut info = ResolveUndoInfo::empty(self.hash_algorithm);
                            info.set_stage(e.stage, e.mode.raw(), e.hash);
                            out.push((e.path.clone(), info));
                        }
                    }
                }
                out
            }
        }
    }

    pub fn resolve_undo_mode(&self) -> ResolveUndoMode {
        match self.resolve_undo {
            ResolveUndoStore::InIndex => ResolveUndoMode::InIndex,
            _ => self.resolve_undo_mode,
        }
    }

    /// Drop all resolve-undo data.
    pub fn clear_resolve_undo(&mut self) {
        if matches!(self.resolve_undo, ResolveUndoStore::None) {
            return;
        }
        self.entries.retain(|e| !e.is_resolve_undo());
        self.resolve_undo = ResolveUndoStore::None;
        self.changed = true;
    }

    /// Take (and forget) the resolve-undo data for `path`.
    fn take_resolve_undo(&mut self, path: &[u8]) -> Option<ResolveUndoInfo> {
        if let ResolveUndoStore::Separate(map) = &mut self.resolve_undo {
            return map.remove(path.as_bstr());
        }
        let info = self.resolve_undo_lookup(path.as_bstr())?;
        let start = self.first_of_name(path);
        let mut i = start;
        while i < self.entries.len() && self.entries[i].path == path {
            if self.entries[i].is_resolve_undo() {
                self.entries.remove(i);
            } else {
                i += 1;
            }
        }
        Some(info)
    }

    /// Put back resolve-undo data for `path`, in the active representation.
    pub(crate) fn restore_resolve_undo(&mut self, path: &[u8], info: ResolveUndoInfo) {
        if matches!(self.resolve_undo, ResolveUndoStore::InIndex) {
            for (stage, mode, hash) in info.stages() {
                self.put_inline(path, stage, mode, hash);
            }
            return;
        }
        if matches!(self.resolve_undo, ResolveUndoStore::None) {
            self.resolve_undo = ResolveUndoStore::Separate(BTreeMap::new());
        }
        if let ResolveUndoStore::Separate(map) = &mut self.resolve_undo {
            map.insert(BString::from(path), info);
        }
    }

    /// Recreate the conflict stages of the resolved entry at `pos`.
    ///
    /// Returns the position of the last entry examined: for an entry that is
    /// already conflicted, the last of its stages, so callers scanning the
    /// array can continue right after it.
    pub fn unmerge_at(&mut self, pos: usize) -> usize {
        if pos >= self.entries.len() || matches!(self.resolve_undo, ResolveUndoStore::None) {
            return pos;
        }
        if self.resolve_undo_mode == ResolveUndoMode::InIndex {
            self.migrate_to_inline();
        }

        let entry = &self.entries[pos];
        if entry.is_resolve_undo() {
            return pos;
        }
        if entry.stage != Stage::Normal {
            let name = entry.path.clone();
            let mut last = pos;
            while last + 1 < self.entries.len() && self.entries[last + 1].path == name {
                last += 1;
            }
            return last;
        }

        let name = entry.path.clone();
        let Some(info) = self.take_resolve_undo(&name) else {
            return pos;
        };

        tracing::debug!(path = %name, "recreating conflict from resolve-undo data");
        self.entries.remove(pos);
        self.invalidate_cache_tree(&name);

        let mut failed = false;
        for (stage, mode, hash) in info.stages() {
            let conflicted = IndexEntry {
                path: name.clone(),
                hash,
                mode: FileMode::from_raw(mode),
                stage,
                stat: StatInfo::default(),
                flags: EntryFlags::empty(),
            };
            if let Err(e) = self.insert(conflicted, InsertOptions::OK_TO_ADD) {
                tracing::warn!(path = %name, error = %e, "cannot recreate conflict stage");
                failed = true;
            }
        }
        self.changed = true;
        self.sync_name_hash(&name);
        if failed {
            self.restore_resolve_undo(&name, info);
            return pos;
        }
        self.unmerge_at(pos)
    }

    /// [`unmerge_at`](Self::unmerge_at) for every resolved entry matching `pathspec`.
    ///
    /// Returns the names that were turned back into conflicts.
    pub fn unmerge_matching(&mut self, pathspec: &dyn PathMatch) -> Vec<BString> {
        let mut restored = Vec::new();
        if matches!(self.resolve_undo, ResolveUndoStore::None) {
            return restored;
        }
        let mut i = 0;
        while i < self.entries.len() {
            let entry = &self.entries[i];
            if entry.is_resolve_undo() || !pathspec.matches(entry.path()) {
                i += 1;
                continue;
            }
            let was_resolved = entry.stage == Stage::Normal;
            let name = entry.path.clone();
            let last = self.unmerge_at(i);
            if was_resolved && self.entries.get(i).is_some_and(|e| e.stage != Stage::Normal) {
                restored.push(name);
            }
            i = last + 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;

    fn hash(n: u8) -> ContentHash {
        ContentHash::Sha1([n; 20])
    }

    fn entry(path: &str, stage: Stage, n: u8) -> IndexEntry {
        IndexEntry::new(path, FileMode::Regular, hash(n), stage).unwrap()
    }

    fn conflicted_then_resolved(mode: ResolveUndoMode) -> IndexState {
        let config = IndexConfig::default().with_resolve_undo_mode(mode);
        let mut state = IndexState::with_config(&config);
        for (stage, n) in [(Stage::Base, 1), (Stage::Ours, 2), (Stage::Theirs, 3)] {
            state.insert(entry("f", stage, n), InsertOptions::OK_TO_ADD).unwrap();
        }
        state.insert(entry("g", Stage::Normal, 9), InsertOptions::OK_TO_ADD).unwrap();
        state.insert(entry("f", Stage::Normal, 4), InsertOptions::OK_TO_ADD).unwrap();
        state
    }

    #[test]
    fn resolving_records_all_stages() {
        for mode in [ResolveUndoMode::Separate, ResolveUndoMode::InIndex] {
            let state = conflicted_then_resolved(mode);
            assert_eq!(state.len(), 2, "{mode:?}");
            let info = state.resolve_undo_lookup(b"f".as_bstr()).unwrap();
            assert_eq!(info.modes, [0o100644; 3]);
            assert_eq!(info.hashes, [hash(1), hash(2), hash(3)]);
            assert!(!state.unmerged());
        }
    }

    #[test]
    fn lookup_identical_across_modes() {
        let separate = conflicted_then_resolved(ResolveUndoMode::Separate);
        let mut migrated = separate.clone();
        migrated.migrate_to_inline();
        assert_eq!(migrated.resolve_undo_mode(), ResolveUndoMode::InIndex);
        assert_eq!(
            separate.resolve_undo_lookup(b"f".as_bstr()),
            migrated.resolve_undo_lookup(b"f".as_bstr())
        );
        assert_eq!(separate.resolve_undo_entries(), migrated.resolve_undo_entries());
        assert_eq!(migrated.len(), separate.len());
        assert!(migrated.resolve_undo_lookup(b"g".as_bstr()).is_none());
    }

    #[test]
    fn unmerge_restores_conflict() {
        for mode in [ResolveUndoMode::Separate, ResolveUndoMode::InIndex] {
            let mut state = conflicted_then_resolved(mode);
            let pos = state.position(b"f".as_bstr()).unwrap();
            let last = state.unmerge_at(pos);

            let stages: Vec<_> = state
                .entries()
                .filter(|e| e.path == "f")
                .map(|e| (e.stage, e.hash))
                .collect();
            assert_eq!(
                stages,
                vec![(Stage::Base, hash(1)), (Stage::Ours, hash(2)), (Stage::Theirs, hash(3))],
                "{mode:?}"
            );
            assert_eq!(state.entry(last).unwrap().stage, Stage::Theirs);
            assert!(state.resolve_undo_lookup(b"f".as_bstr()).is_none());
            assert!(state.unmerged());
        }
    }

    #[test]
    fn unmerge_without_data_is_noop() {
        let mut state = conflicted_then_resolved(ResolveUndoMode::Separate);
        let pos = state.position(b"g".as_bstr()).unwrap();
        assert_eq!(state.unmerge_at(pos), pos);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn unmerge_matching_honours_pathspec() {
        let mut state = conflicted_then_resolved(ResolveUndoMode::Separate);
        let restored = state.unmerge_matching(&|p: &BStr| p == "g");
        assert!(restored.is_empty());
        let restored = state.unmerge_matching(&|_: &BStr| true);
        assert_eq!(restored, vec![BString::from("f")]);
        assert_eq!(state.conflicts(), vec![b"f".as_bstr()]);
    }

    #[test]
    fn version_downgrade_keeps_inline_records_as_a_table() {
        let mut state = conflicted_then_resolved(ResolveUndoMode::InIndex);
        state.set_version(5);
        let before = state.resolve_undo_entries();
        assert_eq!(before.len(), 1);

        state.set_version(2);
        assert_eq!(state.resolve_undo_mode(), ResolveUndoMode::Separate);
        assert!(matches!(state.resolve_undo, ResolveUndoStore::Separate(_)));
        assert!(state.entries.iter().all(|e| !e.is_resolve_undo()));
        assert_eq!(state.resolve_undo_entries(), before);

        // Later conflicts are recorded in the table too.
        state.insert(entry("h", Stage::Ours, 5), InsertOptions::OK_TO_ADD).unwrap();
        state.insert(entry("h", Stage::Normal, 6), InsertOptions::OK_TO_ADD).unwrap();
        assert!(matches!(state.resolve_undo, ResolveUndoStore::Separate(ref map) if map.len() == 2));
    }

    #[test]
    fn clear_drops_inline_pseudo_entries() {
        let mut state = conflicted_then_resolved(ResolveUndoMode::InIndex);
        state.clear_resolve_undo();
        assert!(state.resolve_undo_entries().is_empty());
        assert_eq!(state.len(), 2);
        assert!(state.entries().all(|e| !e.is_resolve_undo()));
    }
}
