//! Directory grouping for the v5 format.
//!
//! Directories live in an arena ordered by their `path/` bytes, which is
//! also depth-first order. Links between nodes are indices.

use std::collections::BTreeMap;

use bstr::{BStr, BString, ByteSlice};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Full path with a trailing `/`; empty for the root.
    pub path: BString,
    pub parent: Option<usize>,
    pub first_child: Option<usize>,
    pub next_sibling: Option<usize>,
    pub nsubtrees: u32,
    /// Indices into the file list passed to [`group_directories`].
    pub files: Vec<usize>,
    /// Indices into the conflict list passed to [`group_directories`].
    pub conflicts: Vec<usize>,
}

impl DirectoryEntry {
    /// Last path component without the slash; empty for the root.
    pub fn name(&self) -> &BStr {
        let trimmed = self.path.strip_suffix(b"/").unwrap_or(&self.path[..]);
        match trimmed.rfind_byte(b'/') {
            Some(i) => trimmed[i + 1..].as_bstr(),
            None => trimmed.as_bstr(),
        }
    }
}

/// Everything up to and including the last `/` of `path`.
pub(crate) fn dir_of(path: &[u8]) -> &[u8] {
    match path.rfind_byte(b'/') {
        Some(i) => &path[..=i],
        None => b"",
    }
}

/// Parent directory of a `path/` key; `None` for the root.
pub(crate) fn parent_of(dir: &[u8]) -> Option<&[u8]> {
    let trimmed = dir.strip_suffix(b"/")?;
    Some(dir_of(trimmed))
}

/// Group sorted `files` and resolve-undo `conflicts` paths by directory.
///
/// The first pass collects the ancestor chain of every path, the second
/// links each directory to its parent and assigns files and conflicts.
/// The result always contains the root at index 0.
pub fn group_directories<F, C>(files: &[F], conflicts: &[C]) -> Vec<DirectoryEntry>
where
    F: AsRef<[u8]>,
    C: AsRef<[u8]>,
{
    let mut keys: BTreeMap<&[u8], usize> = BTreeMap::new();
    keys.insert(b"", 0);
    let all = files.iter().map(bytes).chain(conflicts.iter().map(bytes));
    for path in all {
        let mut dir = dir_of(path);
        while !dir.is_empty() && !keys.contains_key(dir) {
            keys.insert(dir, 0);
            dir = parent_of(dir).unwrap_or(b"");
        }
    }

    let mut dirs: Vec<DirectoryEntry> = Vec::with_capacity(keys.len());
    for (i, (key, slot)) in keys.iter_mut().enumerate() {
        *slot = i;
        dirs.push(DirectoryEntry {
            path: BString::from(*key),
            ..DirectoryEntry::default()
        });
    }

    let mut last_child: Vec<Option<usize>> = vec![None; dirs.len()];
    for i in 1..dirs.len() {
        let parent = parent_of(&dirs[i].path)
            .and_then(|p| keys.get(p).copied())
            .unwrap_or(0);
        dirs[i].parent = Some(parent);
        dirs[parent].nsubtrees += 1;
        match last_child[parent] {
            Some(prev) => dirs[prev].next_sibling = Some(i),
            None => dirs[parent].first_child = Some(i),
        }
        last_child[parent] = Some(i);
    }

    for (i, file) in files.iter().enumerate() {
        if let Some(&d) = keys.get(dir_of(file.as_ref())) {
            dirs[d].files.push(i);
        }
    }
    for (i, conflict) in conflicts.iter().enumerate() {
        if let Some(&d) = keys.get(dir_of(conflict.as_ref())) {
            dirs[d].conflicts.push(i);
        }
    }

    tracing::debug!(
        directories = dirs.len(),
        files = files.len(),
        conflicts = conflicts.len(),
        "grouped index by directory"
    );
    dirs
}

fn bytes<T: AsRef<[u8]>>(t: &T) -> &[u8] {
    t.as_ref()
}

/// Children of `dir`, following the sibling links.
pub fn children(dirs: &[DirectoryEntry], dir: usize) -> impl Iterator<Item = usize> + '_ {
    std::iter::successors(dirs[dir].first_child, move |&c| dirs[c].next_sibling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dirs: &[DirectoryEntry]) -> Vec<String> {
        dirs.iter().map(|d| d.path.to_str_lossy().into_owned()).collect()
    }

    #[test]
    fn ancestors_are_collected_in_depth_first_order() {
        let files = ["a-b/x", "a/b/c/d", "a/e", "a0", "top"];
        let dirs = group_directories(&files, &[] as &[&str]);
        assert_eq!(paths(&dirs), ["", "a-b/", "a/", "a/b/", "a/b/c/"]);
        assert_eq!(dirs[0].files, [3, 4]);
        assert_eq!(dirs[2].files, [2]);
        assert_eq!(dirs[4].files, [1]);
        assert!(dirs[3].files.is_empty());
    }

    #[test]
    fn links_follow_the_tree() {
        let files = ["a/b/x", "a/c/y", "d/z"];
        let dirs = group_directories(&files, &[] as &[&str]);
        assert_eq!(paths(&dirs), ["", "a/", "a/b/", "a/c/", "d/"]);
        assert_eq!(dirs[0].nsubtrees, 2);
        assert_eq!(children(&dirs, 0).collect::<Vec<_>>(), [1, 4]);
        assert_eq!(children(&dirs, 1).collect::<Vec<_>>(), [2, 3]);
        assert_eq!(dirs[3].parent, Some(1));
        assert_eq!(dirs[1].parent, Some(0));
        assert_eq!(dirs[0].parent, None);
        assert_eq!(dirs[3].name(), "c");
        assert_eq!(dirs[0].name(), "");
    }

    #[test]
    fn conflicts_create_directories() {
        let dirs = group_directories(&["f"], &["gone/old", "g"]);
        assert_eq!(paths(&dirs), ["", "gone/"]);
        assert_eq!(dirs[0].conflicts, [1]);
        assert_eq!(dirs[1].conflicts, [0]);
        assert!(dirs[1].files.is_empty());
    }

    #[test]
    fn empty_input_has_root_only() {
        let dirs = group_directories(&[] as &[&str], &[] as &[&str]);
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].nsubtrees, 0);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(dir_of(b"a/b/c"), b"a/b/");
        assert_eq!(dir_of(b"c"), b"");
        assert_eq!(parent_of(b"a/b/"), Some(&b"a/"[..]));
        assert_eq!(parent_of(b"a/"), Some(&b""[..]));
        assert_eq!(parent_of(b""), None);
    }
}
