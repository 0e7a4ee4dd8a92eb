//! Resolve-undo extension (REUC).
//!
//! One record per resolved path: the path, three octal modes (0 when the
//! stage was absent), each NUL-terminated, then the hash of every present
//! stage.

use bstr::{BString, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};

use crate::resolve_undo::ResolveUndoInfo;
use crate::IndexError;

pub const SIGNATURE: &[u8; 4] = b"REUC";

fn bad(reason: impl Into<String>) -> IndexError {
    IndexError::corrupt(format!("REUC extension: {}", reason.into()))
}

pub fn parse(
    data: &[u8],
    algo: HashAlgorithm,
) -> Result<Vec<(BString, ResolveUndoInfo)>, IndexError> {
    let mut records = Vec::new();
    let mut cursor = 0;
    let null = algo.null_hash();

    while cursor < data.len() {
        let nul = data[cursor..]
            .find_byte(0)
            .ok_or_else(|| bad("missing NUL in path"))?;
        let path = BString::from(&data[cursor..cursor + nul]);
        cursor += nul + 1;

        let mut modes = [0u32; 3];
        for mode in &mut modes {
            let nul = data
                .get(cursor..)
                .and_then(|rest| rest.find_byte(0))
                .ok_or_else(|| bad("missing NUL in mode"))?;
            let text = std::str::from_utf8(&data[cursor..cursor + nul])
                .map_err(|_| bad("invalid mode encoding"))?;
            *mode = u32::from_str_radix(text, 8).map_err(|_| bad(format!("invalid mode: {text}")))?;
            cursor += nul + 1;
        }

        let mut hashes = [null; 3];
        for (i, slot) in hashes.iter_mut().enumerate() {
            if modes[i] == 0 {
                continue;
            }
            let len = algo.digest_len();
            let raw = data
                .get(cursor..cursor + len)
                .ok_or_else(|| bad("truncated hash"))?;
            *slot = ContentHash::from_bytes(raw, algo)?;
            cursor += len;
        }

        records.push((path, ResolveUndoInfo { modes, hashes }));
    }

    Ok(records)
}

pub fn serialize<'a>(records: impl IntoIterator<Item = (&'a [u8], &'a ResolveUndoInfo)>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (path, info) in records {
        buf.extend_from_slice(path);
        buf.push(0);
        for mode in &info.modes {
            buf.extend_from_slice(format!("{mode:o}").as_bytes());
            buf.push(0);
        }
        for (mode, hash) in info.modes.iter().zip(&info.hashes) {
            if *mode != 0 {
                buf.extend_from_slice(hash.as_bytes());
            }
        }
    }
    buf
}
