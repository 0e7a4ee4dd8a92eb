//! Name ordering.
//!
//! The entry array is sorted by [`compare_positions`]: raw bytes, shorter
//! name first on a shared prefix, then stage. Tree objects use a different
//! order in which a directory sorts as if its name ended in `/`;
//! [`compare_names`] and [`compare_names_df`] implement that one for
//! cache-tree and directory-record ordering.

use std::cmp::Ordering;

use crate::Stage;

/// Order of the entry array: name bytes (a strict prefix sorts first), then stage.
pub fn compare_positions(a: &[u8], a_stage: Stage, b: &[u8], b_stage: Stage) -> Ordering {
    a.cmp(b).then(a_stage.cmp(&b_stage))
}

/// Tree order: compare the common prefix, then treat a directory as if its
/// name carried a trailing `/`.
pub fn compare_names(a: &[u8], a_is_dir: bool, b: &[u8], b_is_dir: bool) -> Ordering {
    let len = a.len().min(b.len());
    match a[..len].cmp(&b[..len]) {
        Ordering::Equal => {}
        other => return other,
    }
    let c1 = next_byte(a, len, a_is_dir);
    let c2 = next_byte(b, len, b_is_dir);
    c1.cmp(&c2)
}

/// Like [`compare_names`], except that a file and a directory with the same
/// name compare equal. Used to detect file/directory clashes in tree order.
pub fn compare_names_df(a: &[u8], a_is_dir: bool, b: &[u8], b_is_dir: bool) -> Ordering {
    let len = a.len().min(b.len());
    match a[..len].cmp(&b[..len]) {
        Ordering::Equal => {}
        other => return other,
    }
    if a.len() == b.len() {
        return Ordering::Equal;
    }
    let c1 = next_byte(a, len, a_is_dir);
    let c2 = next_byte(b, len, b_is_dir);
    if (c1 == Some(b'/') && c2.is_none()) || (c2 == Some(b'/') && c1.is_none()) {
        return Ordering::Equal;
    }
    c1.cmp(&c2)
}

// Byte after the shared prefix; a directory's name ends with an implicit '/'.
fn next_byte(name: &[u8], at: usize, is_dir: bool) -> Option<u8> {
    match name.get(at) {
        Some(&c) => Some(c),
        None if is_dir => Some(b'/'),
        None => None,
    }
}
