use std::path::Path;
use std::process::{Command, Output};

use dirc_hash::ContentHash;
use dirc_index::{FileMode, IndexConfig, IndexEntry, IndexState, InsertOptions, Stage};

fn dirc(index: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dirc"))
        .arg("-f")
        .arg(index)
        .args(args)
        .env_remove("GIT_INDEX_VERSION")
        .env_remove("DIRC_LOG")
        .output()
        .expect("failed to run dirc")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn write_sample(path: &Path) {
    let mut state = IndexState::default();
    for (n, p) in ["a.txt", "dir/b.txt", "dir/sub/c.txt"].iter().enumerate() {
        let e = IndexEntry::new(*p, FileMode::Regular, ContentHash::Sha1([n as u8 + 1; 20]), Stage::Normal)
            .unwrap();
        state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
    }
    for stage in Stage::CONFLICTED {
        let e = IndexEntry::new("dir/m.txt", FileMode::Regular, ContentHash::Sha1([9; 20]), stage).unwrap();
        state.insert(e, InsertOptions::OK_TO_ADD).unwrap();
    }
    let resolved = IndexEntry::new("dir/m.txt", FileMode::Regular, ContentHash::Sha1([8; 20]), Stage::Normal)
        .unwrap();
    state.insert(resolved, InsertOptions::OK_TO_ADD).unwrap();
    state.write(path, &IndexConfig::default(), None).unwrap();
}

#[test]
fn ls_lists_entries_and_resolve_undo() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index");
    write_sample(&index);

    let out = dirc(&index, &["ls"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "a.txt\ndir/b.txt\ndir/m.txt\ndir/sub/c.txt\n");

    let out = dirc(&index, &["ls", "--resolve-undo"]);
    let lines: Vec<_> = stdout(&out).lines().map(str::to_owned).collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("100644 0909"));
    assert!(lines[0].ends_with(" 1\tdir/m.txt"));
}

#[test]
fn convert_to_v5_then_dump_directories() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index");
    write_sample(&index);

    let out = dirc(&index, &["convert", "--to", "5"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = dirc(&index, &["dump-dirs"]);
    assert!(out.status.success());
    let dirs: Vec<String> = stdout(&out)
        .lines()
        .map(|l| l.split('\t').next().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(dirs, ["/", "dir/", "dir/sub/"]);

    let out = dirc(&index, &["verify"]);
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("version 5: 4 entries, 1 resolve-undo records"));
}

#[test]
fn unmerge_restores_conflict_stages() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index");
    write_sample(&index);

    let out = dirc(&index, &["unmerge", "dir/m.txt"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "dir/m.txt\n");

    let out = dirc(&index, &["ls", "-u"]);
    assert_eq!(stdout(&out).lines().count(), 3);
}

#[test]
fn refresh_reports_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index");
    write_sample(&index);
    let worktree = dir.path().join("wt");
    std::fs::create_dir(&worktree).unwrap();

    let out = dirc(&index, &["--work-tree", worktree.to_str().unwrap(), "refresh"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(stdout(&out).matches("a.txt: deleted").count(), 1);
    assert!(!String::from_utf8_lossy(&out.stderr).contains("deleted"));

    let out = dirc(
        &index,
        &["--work-tree", worktree.to_str().unwrap(), "refresh", "--ignore-missing"],
    );
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn corrupt_index_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let index = dir.path().join("index");
    std::fs::write(&index, b"DIRC\0\0\0\x09garbage garbage garbage").unwrap();
    let out = dirc(&index, &["ls"]);
    assert_eq!(out.status.code(), Some(128));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("fatal:"));

    let out = dirc(&index, &["convert", "--to", "7"]);
    assert_eq!(out.status.code(), Some(128));
}
