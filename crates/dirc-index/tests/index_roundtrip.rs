//! Write an index in every format, read it back, and compare.

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::hasher::Hasher;
use dirc_hash::{ContentHash, HashAlgorithm};
use dirc_index::{
    EntryFlags, FileMode, IndexConfig, IndexEntry, IndexError, IndexState, InsertOptions, MappedIndex,
    Pathspec, ResolveUndoMode,
};
use dirc_index::{Stage, StatData, StatInfo, Timestamp};

fn hash(n: u8) -> ContentHash {
    ContentHash::Sha1([n; 20])
}

fn entry(path: &str, n: u8, stage: Stage) -> IndexEntry {
    let mut e = IndexEntry::new(path, FileMode::Regular, hash(n), stage).unwrap();
    e.stat = StatInfo::Full(StatData {
        mtime: Timestamp::new(1_000 + n as u32, 0),
        size: n as u32,
        ino: n as u32,
        ..StatData::default()
    });
    e
}

/// A small tree with a resolved conflict at `src/merge.c`.
fn sample(intent_to_add: bool) -> IndexState {
    let mut state = IndexState::default();
    for (i, p) in ["Makefile", "src/lib/util.c", "src/main.c", "src/merge.c", "t/t0000.sh"]
        .iter()
        .enumerate()
    {
        state.insert(entry(p, i as u8 + 1, Stage::Normal), InsertOptions::OK_TO_ADD).unwrap();
    }
    for (n, stage) in [(21, Stage::Base), (22, Stage::Ours), (23, Stage::Theirs)] {
        state.insert(entry("src/conflict.c", n, stage), InsertOptions::OK_TO_ADD).unwrap();
    }
    state
        .insert(entry("src/conflict.c", 24, Stage::Normal), InsertOptions::OK_TO_ADD)
        .unwrap();
    if intent_to_add {
        let mut ita = entry("docs/new.md", 30, Stage::Normal);
        ita.flags |= EntryFlags::INTENT_TO_ADD;
        state.insert(ita, InsertOptions::OK_TO_ADD).unwrap();
    }
    state
}

fn summary(state: &IndexState) -> Vec<(BString, u8, ContentHash, u32)> {
    state
        .entries()
        .map(|e| (e.path.clone(), e.stage.as_u8(), e.hash, e.mode.raw()))
        .collect()
}

#[test]
fn every_version_round_trips_through_a_file() {
    for (version, ita, stored) in [(2, false, 2), (3, true, 3), (3, false, 2), (4, true, 4), (5, true, 5)] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let config = IndexConfig::default().with_version(version);
        let mut state = sample(ita);
        state.write(&path, &config, None).unwrap();

        let loaded = IndexState::load(&path, &config).unwrap();
        assert_eq!(loaded.version(), Some(stored), "requested {version}");
        assert_eq!(summary(&loaded), summary(&state), "version {version}");
        assert_eq!(loaded.resolve_undo_entries(), state.resolve_undo_entries());
        assert_eq!(
            loaded.exists(BStr::new("docs/new.md")).map(|e| e.flags.contains(EntryFlags::INTENT_TO_ADD)),
            ita.then_some(true)
        );
    }
}

#[test]
fn resolved_conflict_keeps_its_stages() {
    let state = sample(false);
    let info = state.resolve_undo_lookup(BStr::new("src/conflict.c")).unwrap();
    let stages: Vec<_> = info.stages().map(|(s, _, h)| (s, h)).collect();
    assert_eq!(
        stages,
        [(Stage::Base, hash(21)), (Stage::Ours, hash(22)), (Stage::Theirs, hash(23))]
    );
    assert!(!state.unmerged());
}

#[test]
fn unmerge_after_reload_restores_conflict() {
    for version in [2, 5] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let config = IndexConfig::default().with_version(version);
        sample(false).write(&path, &config, None).unwrap();

        let mut loaded = IndexState::load(&path, &config).unwrap();
        let restored = loaded.unmerge_matching(&Pathspec::parse(&["src/conflict.c"]));
        assert_eq!(restored, [BString::from("src/conflict.c")]);
        assert!(loaded.unmerged());
        let stages: Vec<u8> = loaded
            .entries()
            .filter(|e| e.path == "src/conflict.c")
            .map(|e| e.stage.as_u8())
            .collect();
        assert_eq!(stages, [1, 2, 3]);
        assert!(loaded.resolve_undo_entries().is_empty());
    }
}

#[test]
fn inline_resolve_undo_survives_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");
    let config = IndexConfig::default().with_resolve_undo_mode(ResolveUndoMode::InIndex);
    let mut state = IndexState::with_config(&config);
    for (n, stage) in [(1, Stage::Ours), (2, Stage::Theirs)] {
        state.insert(entry("f", n, stage), InsertOptions::OK_TO_ADD).unwrap();
    }
    state.insert(entry("f", 3, Stage::Normal), InsertOptions::OK_TO_ADD).unwrap();
    assert_eq!(state.len(), 1);
    state.write(&path, &config, None).unwrap();

    let separate = IndexState::load(&path, &IndexConfig::default()).unwrap();
    assert_eq!(separate.resolve_undo_mode(), ResolveUndoMode::Separate);
    assert_eq!(separate.resolve_undo_entries(), state.resolve_undo_entries());
}

#[test]
fn empty_index_is_header_and_checksum() {
    let state = IndexState::default();
    let data = state.encode(&IndexConfig::default()).unwrap();
    assert_eq!(data.len(), 12 + 20);
    assert_eq!(&data[..12], b"DIRC\0\0\0\x02\0\0\0\0");
    let decoded = IndexState::decode(&data, &IndexConfig::default()).unwrap();
    assert!(decoded.is_empty());

    let v5 = state.encode(&IndexConfig::default().with_version(5)).unwrap();
    let decoded = IndexState::decode(&v5, &IndexConfig::default()).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(decoded.version(), Some(5));
}

#[test]
fn prefix_compression_shrinks_deep_trees() {
    let mut state = IndexState::default();
    for i in 0..64u8 {
        let p = format!("very/long/directory/name/shared/by/all/file{i:02}.txt");
        state.insert(entry(&p, i, Stage::Normal), InsertOptions::OK_TO_ADD).unwrap();
    }
    let v2 = state.encode(&IndexConfig::default().with_version(2)).unwrap();
    let v4 = state.encode(&IndexConfig::default().with_version(4)).unwrap();
    assert!(v4.len() < v2.len(), "v4 {} >= v2 {}", v4.len(), v2.len());
    let back = IndexState::decode(&v4, &IndexConfig::default()).unwrap();
    assert_eq!(summary(&back), summary(&state));
}

/// Append an extension to a v2 image and fix up the trailing checksum.
fn with_extension(data: &[u8], signature: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut body = data[..data.len() - 20].to_vec();
    body.extend_from_slice(signature);
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(payload);
    let sum = Hasher::digest(HashAlgorithm::Sha1, &body).unwrap();
    body.extend_from_slice(sum.as_bytes());
    body
}

#[test]
fn optional_extensions_are_skipped_and_dropped() {
    let state = sample(false);
    let data = state.encode(&IndexConfig::default()).unwrap();

    let optional = with_extension(&data, b"link", b"payload");
    let loaded = IndexState::decode(&optional, &IndexConfig::default()).unwrap();
    assert_eq!(loaded.unknown_extensions(), [*b"link"]);
    assert_eq!(summary(&loaded), summary(&state));
    let rewritten = loaded.encode(&IndexConfig::default()).unwrap();
    assert!(rewritten.find(b"link").is_none());

    let required = with_extension(&data, b"LINK", b"payload");
    match IndexState::decode(&required, &IndexConfig::default()) {
        Err(IndexError::UnsupportedExtension { signature }) => assert_eq!(signature, "LINK"),
        other => panic!("expected unsupported extension, got {other:?}"),
    }
}

#[test]
fn damaged_checksum_is_rejected_unless_skipped() {
    let mut data = sample(false).encode(&IndexConfig::default()).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    assert!(matches!(
        IndexState::decode(&data, &IndexConfig::default()),
        Err(IndexError::ChecksumMismatch)
    ));
    let lenient = IndexConfig::default().with_skip_hash_check(true);
    assert_eq!(IndexState::decode(&data, &lenient).unwrap().len(), 6);
}

#[test]
fn filtered_load_matches_full_load() {
    let dir = tempfile::tempdir().unwrap();
    for version in [2, 5] {
        let path = dir.path().join(format!("index.v{version}"));
        let config = IndexConfig::default().with_version(version);
        sample(false).write(&path, &config, None).unwrap();

        let mapped = MappedIndex::open(&path, &config).unwrap();
        let full = mapped.load().unwrap();
        let src = mapped.load_filtered(BStr::new("src")).unwrap();
        let expected: Vec<_> = summary(&full)
            .into_iter()
            .filter(|(p, ..)| p.starts_with(b"src/"))
            .collect();
        assert_eq!(summary(&src), expected, "version {version}");
        assert_eq!(src.resolve_undo_entries(), full.resolve_undo_entries());
        assert!(src.cache_tree().is_none());
    }
}
