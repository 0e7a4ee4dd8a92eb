//! Refreshing cached stat data against the worktree.

use std::io;

use bstr::BString;

use crate::config::IndexConfig;
use crate::entry::{EntryFlags, IndexEntry};
use crate::pathspec::PathMatch;
use crate::stat::{ChangeBits, ContentCheck, MatchOptions, StatOracle};
use crate::state::IndexState;
use crate::Stage;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefreshFlags: u32 {
        /// Re-examine entries marked VALID and clear VALID on modified ones.
        const REALLY = 0x01;
        /// Do not report unmerged entries.
        const UNMERGED = 0x02;
        /// Do not collect per-entry outcomes.
        const QUIET = 0x04;
        /// Missing files are not an error.
        const IGNORE_MISSING = 0x08;
        const IGNORE_SUBMODULES = 0x10;
    }
}

/// Why an entry could not be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("file is missing")]
    Missing,
    #[error("cannot stat file: {0}")]
    Unreadable(io::ErrorKind),
    #[error("content differs ({0:?})")]
    ContentChanged(ChangeBits),
}

/// Result of refreshing one entry that was not modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRefresh {
    /// Stat data already matched; the entry may have been marked UPTODATE.
    Unchanged,
    /// Content matched but stat data was stale; store this entry instead.
    Updated(IndexEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Added,
    Deleted,
    TypeChanged,
    Modified,
    NeedsMerge,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Added => "added",
            RefreshOutcome::Deleted => "deleted",
            RefreshOutcome::TypeChanged => "typechange",
            RefreshOutcome::Modified => "needs update",
            RefreshOutcome::NeedsMerge => "needs merge",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub outcomes: Vec<(BString, RefreshOutcome)>,
    pub has_errors: bool,
}

impl RefreshReport {
    /// Under `quiet`, only unmerged entries count as errors.
    fn push(&mut self, path: BString, outcome: RefreshOutcome, quiet: bool) {
        if outcome == RefreshOutcome::NeedsMerge {
            self.has_errors = true;
        }
        if quiet {
            return;
        }
        self.has_errors = true;
        tracing::debug!(path = %path, "{}", outcome.label());
        self.outcomes.push((path, outcome));
    }
}

/// Compare one entry with the worktree and refresh its stat data when the
/// content turns out to be unchanged.
pub(crate) fn refresh_one(
    entry: &mut IndexEntry,
    options: MatchOptions,
    oracle: &StatOracle<'_>,
) -> Result<EntryRefresh, RefreshError> {
    if entry.is_uptodate() {
        return Ok(EntryRefresh::Unchanged);
    }
    // Assume-unchanged and sparse entries are trusted without looking at
    // the worktree.
    let trusted = (!options.contains(MatchOptions::IGNORE_VALID)
        && entry.flags.contains(EntryFlags::VALID))
        || (!options.contains(MatchOptions::IGNORE_SKIP_WORKTREE)
            && entry.flags.contains(EntryFlags::SKIP_WORKTREE));
    if trusted {
        entry.mark_uptodate();
        return Ok(EntryRefresh::Unchanged);
    }

    let st = oracle.check.lstat(entry.path()).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => RefreshError::Missing,
        kind => RefreshError::Unreadable(kind),
    })?;

    let ignore_valid = options.contains(MatchOptions::IGNORE_VALID);
    let changed = oracle.match_stat(entry, &st, options);
    if changed.is_empty() {
        // Under REALLY with assume-unchanged configured, fall through so the
        // entry gets VALID back.
        if !(ignore_valid
            && oracle.config.assume_unchanged
            && !entry.flags.contains(EntryFlags::VALID))
        {
            if !entry.mode.is_gitlink() {
                entry.mark_uptodate();
            }
            return Ok(EntryRefresh::Unchanged);
        }
    }

    if !oracle.modified(entry, &st, options).is_empty() {
        return Err(RefreshError::ContentChanged(changed));
    }

    let mut updated = entry.clone();
    updated.fill_stat(&st, oracle.config);
    // Paths explicitly marked as not assumed unchanged stay that way.
    if !ignore_valid && oracle.config.assume_unchanged && !entry.flags.contains(EntryFlags::VALID) {
        updated.flags.remove(EntryFlags::VALID);
    }
    Ok(EntryRefresh::Updated(updated))
}

impl IndexState {
    /// Refresh the entry at `pos` without storing the result.
    ///
    /// The entry is marked UPTODATE in place when it is clean; an
    /// [`EntryRefresh::Updated`] result has to be put back with
    /// [`replace_at`](IndexState::replace_at).
    pub fn refresh_entry(
        &mut self,
        pos: usize,
        options: MatchOptions,
        config: &IndexConfig,
        worktree: &dyn ContentCheck,
    ) -> Result<EntryRefresh, RefreshError> {
        let oracle = StatOracle::new(config, self.timestamp, worktree);
        match self.entries.get_mut(pos) {
            Some(entry) if !entry.is_resolve_undo() => refresh_one(entry, options, &oracle),
            _ => Err(RefreshError::Missing),
        }
    }

    /// Refresh every entry selected by `pathspec`.
    ///
    /// Problems are collected per entry; the scan always runs to the end.
    pub fn refresh_all(
        &mut self,
        pathspec: &dyn PathMatch,
        flags: RefreshFlags,
        config: &IndexConfig,
        worktree: &dyn ContentCheck,
    ) -> RefreshReport {
        let quiet = flags.contains(RefreshFlags::QUIET);
        let options = if flags.contains(RefreshFlags::REALLY) {
            MatchOptions::IGNORE_VALID
        } else {
            MatchOptions::empty()
        };
        let oracle = StatOracle::new(config, self.timestamp, worktree);
        let mut report = RefreshReport::default();

        let mut i = 0;
        while i < self.entries.len() {
            let entry = &self.entries[i];
            if entry.is_resolve_undo()
                || (flags.contains(RefreshFlags::IGNORE_SUBMODULES) && entry.mode.is_gitlink())
                || !pathspec.matches(entry.path())
            {
                i += 1;
                continue;
            }

            if entry.stage != Stage::Normal {
                let name = entry.path.clone();
                while i < self.entries.len() && self.entries[i].path == name {
                    i += 1;
                }
                if !flags.contains(RefreshFlags::UNMERGED) {
                    report.push(name, RefreshOutcome::NeedsMerge, quiet);
                }
                continue;
            }

            match refresh_one(&mut self.entries[i], options, &oracle) {
                Ok(EntryRefresh::Unchanged) => {}
                Ok(EntryRefresh::Updated(updated)) => {
                    self.entries[i] = updated;
                    self.changed = true;
                }
                Err(RefreshError::Missing) if flags.contains(RefreshFlags::IGNORE_MISSING) => {}
                Err(err) => {
                    let entry = &mut self.entries[i];
                    if flags.contains(RefreshFlags::REALLY)
                        && matches!(err, RefreshError::ContentChanged(_))
                        && entry.flags.contains(EntryFlags::VALID)
                    {
                        entry.flags.remove(EntryFlags::VALID);
                        self.changed = true;
                    }
                    let entry = &self.entries[i];
                    let outcome = match err {
                        RefreshError::Missing => RefreshOutcome::Deleted,
                        _ if entry.flags.contains(EntryFlags::INTENT_TO_ADD) => {
                            RefreshOutcome::Added
                        }
                        RefreshError::ContentChanged(bits)
                            if bits.contains(ChangeBits::TYPE_CHANGED) =>
                        {
                            RefreshOutcome::TypeChanged
                        }
                        _ => RefreshOutcome::Modified,
                    };
                    report.push(entry.path.clone(), outcome, quiet);
                }
            }
            i += 1;
        }

        tracing::debug!(
            entries = self.entries.len(),
            problems = report.outcomes.len(),
            "refresh finished"
        );
        report
    }

    /// Whether any entry is racily clean against the index timestamp.
    pub fn has_racy_timestamp(&self, config: &IndexConfig) -> bool {
        self.entries().any(|e| crate::stat::is_racy(self.timestamp, e, config.use_nsec))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bstr::{BStr, ByteSlice};
    use dirc_hash::ContentHash;

    use super::*;
    use crate::entry::{FileMode, StatData, StatInfo, Timestamp};
    use crate::stat::FileStat;
    use crate::state::InsertOptions;

    #[derive(Default)]
    struct FakeTree {
        files: HashMap<BString, (FileStat, ContentHash)>,
    }

    impl ContentCheck for FakeTree {
        fn lstat(&self, path: &BStr) -> io::Result<FileStat> {
            self.files
                .get(path)
                .map(|(st, _)| *st)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn blob_matches(&self, path: &BStr, expected: &ContentHash) -> bool {
            self.files.get(path).is_some_and(|(_, h)| h == expected)
        }

        fn link_matches(&self, path: &BStr, expected: &ContentHash) -> bool {
            self.blob_matches(path, expected)
        }

        fn read_content(&self, _path: &BStr, _st: &FileStat) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn hash(n: u8) -> ContentHash {
        ContentHash::Sha1([n; 20])
    }

    fn stat_at(mtime: u32) -> FileStat {
        FileStat {
            mode: 0o100644,
            ctime: Timestamp::new(mtime, 0),
            mtime: Timestamp::new(mtime, 0),
            ino: 3,
            size: 4,
            ..FileStat::default()
        }
    }

    fn staged(state: &mut IndexState, path: &str, st: &FileStat, h: ContentHash) {
        let mut e = IndexEntry::new(path, FileMode::Regular, h, Stage::Normal).unwrap();
        e.stat = StatInfo::Full(StatData::from_file_stat(st));
        state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
    }

    #[test]
    fn clean_entries_become_uptodate() {
        let config = IndexConfig::default();
        let mut tree = FakeTree::default();
        tree.files.insert("a".into(), (stat_at(10), hash(1)));
        let mut state = IndexState::default();
        staged(&mut state, "a", &stat_at(10), hash(1));

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::empty(), &config, &tree);
        assert!(!report.has_errors);
        assert!(state.entries().next().unwrap().is_uptodate());
    }

    #[test]
    fn touched_but_identical_file_gets_new_stat() {
        let config = IndexConfig::default();
        let mut tree = FakeTree::default();
        tree.files.insert("a".into(), (stat_at(20), hash(1)));
        let mut state = IndexState::default();
        staged(&mut state, "a", &stat_at(10), hash(1));
        state.changed = false;

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::empty(), &config, &tree);
        assert!(!report.has_errors);
        assert!(state.is_changed());
        let e = state.entries().next().unwrap();
        assert_eq!(e.stat.mtime(), Timestamp::new(20, 0));
    }

    #[test]
    fn outcomes_are_classified() {
        let config = IndexConfig::default();
        let mut tree = FakeTree::default();
        let mut state = IndexState::default();

        staged(&mut state, "deleted", &stat_at(10), hash(1));

        staged(&mut state, "modified", &stat_at(10), hash(1));
        let mut grown = stat_at(11);
        grown.size = 9;
        tree.files.insert("modified".into(), (grown, hash(2)));

        staged(&mut state, "typechange", &stat_at(10), hash(1));
        let mut link = stat_at(10);
        link.mode = 0o120777;
        tree.files.insert("typechange".into(), (link, hash(1)));

        let mut ita = IndexEntry::new("ita", FileMode::Regular, hash(4), Stage::Normal).unwrap();
        ita.flags |= EntryFlags::INTENT_TO_ADD;
        state.insert(ita, InsertOptions::OK_TO_ADD).unwrap();
        tree.files.insert("ita".into(), (stat_at(10), hash(5)));

        for stage in [Stage::Ours, Stage::Theirs] {
            let e = IndexEntry::new("merge", FileMode::Regular, hash(6), stage).unwrap();
            state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
        }

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::empty(), &config, &tree);
        assert!(report.has_errors);
        let got: HashMap<_, _> = report.outcomes.into_iter().collect();
        assert_eq!(got[b"deleted".as_bstr()], RefreshOutcome::Deleted);
        assert_eq!(got[b"modified".as_bstr()], RefreshOutcome::Modified);
        assert_eq!(got[b"typechange".as_bstr()], RefreshOutcome::TypeChanged);
        assert_eq!(got[b"ita".as_bstr()], RefreshOutcome::Added);
        assert_eq!(got[b"merge".as_bstr()], RefreshOutcome::NeedsMerge);
        assert_eq!(got.len(), 5);
    }

    #[test]
    fn flags_filter_reports() {
        let config = IndexConfig::default();
        let tree = FakeTree::default();
        let mut state = IndexState::default();
        staged(&mut state, "gone", &stat_at(10), hash(1));
        let e = IndexEntry::new("merge", FileMode::Regular, hash(6), Stage::Ours).unwrap();
        state.insert(e, InsertOptions::OK_TO_ADD).unwrap();

        let report = state.refresh_all(
            &|_: &BStr| true,
            RefreshFlags::IGNORE_MISSING | RefreshFlags::UNMERGED,
            &config,
            &tree,
        );
        assert!(!report.has_errors);

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::QUIET, &config, &tree);
        assert!(report.has_errors);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn quiet_refresh_only_fails_on_unmerged_entries() {
        let config = IndexConfig::default();
        let tree = FakeTree::default();
        let mut state = IndexState::default();
        staged(&mut state, "gone", &stat_at(10), hash(1));

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::QUIET, &config, &tree);
        assert!(!report.has_errors);
        assert!(report.outcomes.is_empty());

        let e = IndexEntry::new("merge", FileMode::Regular, hash(6), Stage::Ours).unwrap();
        state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::QUIET, &config, &tree);
        assert!(report.has_errors);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn sparse_and_assume_unchanged_entries_skip_the_worktree() {
        let config = IndexConfig::default();
        let tree = FakeTree::default();
        let mut state = IndexState::default();
        staged(&mut state, "sparse", &stat_at(10), hash(1));
        staged(&mut state, "valid", &stat_at(10), hash(1));
        state.entry_mut(0).unwrap().flags |= EntryFlags::SKIP_WORKTREE;
        state.entry_mut(1).unwrap().flags |= EntryFlags::VALID;

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::empty(), &config, &tree);
        assert_eq!(report, RefreshReport::default());
        assert!(state.entries().all(|e| e.is_uptodate()));
    }

    #[test]
    fn ignore_options_send_trusted_entries_to_the_worktree() {
        let config = IndexConfig::default();
        let tree = FakeTree::default();
        let oracle = StatOracle::new(&config, None, &tree);

        let mut sparse = IndexEntry::new("sparse", FileMode::Regular, hash(1), Stage::Normal).unwrap();
        sparse.flags |= EntryFlags::SKIP_WORKTREE;
        let mut valid = IndexEntry::new("valid", FileMode::Regular, hash(1), Stage::Normal).unwrap();
        valid.flags |= EntryFlags::VALID;

        assert_eq!(
            refresh_one(&mut sparse.clone(), MatchOptions::IGNORE_SKIP_WORKTREE, &oracle),
            Err(RefreshError::Missing)
        );
        assert_eq!(
            refresh_one(&mut valid.clone(), MatchOptions::IGNORE_VALID, &oracle),
            Err(RefreshError::Missing)
        );
        assert_eq!(refresh_one(&mut sparse, MatchOptions::empty(), &oracle), Ok(EntryRefresh::Unchanged));
        assert!(sparse.is_uptodate());

        // REALLY re-examines VALID entries, so a missing one is reported.
        let mut state = IndexState::default();
        state.insert(valid, InsertOptions::OK_TO_ADD).unwrap();
        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::REALLY, &config, &tree);
        assert_eq!(report.outcomes, vec![(BString::from("valid"), RefreshOutcome::Deleted)]);
    }

    #[test]
    fn really_clears_valid_on_modified_entries() {
        let config = IndexConfig::default();
        let mut tree = FakeTree::default();
        let mut grown = stat_at(11);
        grown.size = 9;
        tree.files.insert("a".into(), (grown, hash(2)));
        let mut state = IndexState::default();
        staged(&mut state, "a", &stat_at(10), hash(1));
        state.entry_mut(0).unwrap().flags |= EntryFlags::VALID;
        state.changed = false;

        let report = state.refresh_all(&|_: &BStr| true, RefreshFlags::REALLY, &config, &tree);
        assert!(report.has_errors);
        assert!(!state.entry(0).unwrap().flags.contains(EntryFlags::VALID));
        assert!(state.is_changed());
    }

    #[test]
    fn pathspec_limits_scan() {
        let config = IndexConfig::default();
        let tree = FakeTree::default();
        let mut state = IndexState::default();
        staged(&mut state, "a", &stat_at(10), hash(1));
        staged(&mut state, "b", &stat_at(10), hash(1));
        let report = state.refresh_all(&|p: &BStr| p == BStr::new("b"), RefreshFlags::empty(), &config, &tree);
        assert_eq!(report.outcomes, vec![(BString::from("b"), RefreshOutcome::Deleted)]);
    }

    #[test]
    fn racy_detection() {
        let config = IndexConfig::default();
        let mut state = IndexState::default();
        staged(&mut state, "a", &stat_at(10), hash(1));
        assert!(!state.has_racy_timestamp(&config));
        state.timestamp = Some(Timestamp::new(10, 0));
        assert!(state.has_racy_timestamp(&config));
        state.timestamp = Some(Timestamp::new(11, 0));
        assert!(!state.has_racy_timestamp(&config));
    }
}
