//! Working-tree index for the dirc version-control core.
//!
//! The index records, for every tracked path, the blob it should contain and
//! the filesystem metadata last seen for it, so that "is this file modified"
//! can be answered from `lstat` alone in the common case.
//!
//! - [`IndexEntry`] and the name comparators in [`name`] define ordering.
//! - [`stat`] decides whether an entry is dirty, including racy timestamps.
//! - [`IndexState`] owns the sorted entries and every mutation on them.
//! - [`resolve_undo`] keeps pre-resolution conflict stages.
//! - [`codec`] reads and writes formats 2 to 5.

pub mod codec;
pub mod config;
pub mod entry;
pub mod extensions;
mod file;
pub mod name;
pub mod pathspec;
mod refresh;
pub mod resolve_undo;
pub mod stat;
mod state;

pub use codec::MappedIndex;
pub use config::IndexConfig;
pub use entry::{EntryFlags, FileMode, IndexEntry, StatData, StatInfo, Timestamp};
pub use error::IndexError;
pub use extensions::tree::CacheTree;
pub use pathspec::{PathMatch, Pathspec};
pub use refresh::{EntryRefresh, RefreshError, RefreshFlags, RefreshOutcome, RefreshReport};
pub use resolve_undo::{ResolveUndoInfo, ResolveUndoMode};
pub use stat::{ChangeBits, ContentCheck, FileStat, MatchOptions, StatOracle, Worktree};
pub use state::{AddFlags, AddOutcome, BlobWriter, IndexState, InsertOptions};

mod error {
    use bstr::BString;

    #[derive(Debug, thiserror::Error)]
    pub enum IndexError {
        #[error("index file corrupt: {reason}")]
        Corrupt { reason: String },

        #[error("unsupported index version: {0}")]
        UnsupportedVersion(u32),

        #[error("index checksum mismatch")]
        ChecksumMismatch,

        #[error("index uses {signature} extension, which we do not understand")]
        UnsupportedExtension { signature: String },

        #[error("invalid path '{path}'")]
        PathInvalid { path: BString },

        #[error("'{path}' appears as both a file and as a directory")]
        Conflict { path: BString },

        #[error("cache entry '{path}' has a null hash")]
        NullHash { path: BString },

        #[error("'{path}' (stage {stage}) is not in the index")]
        NotFound { path: BString, stage: u8 },

        #[error("{path}: can only add regular files, symbolic links or git-directories")]
        UnsupportedFileType { path: BString },

        #[error("unable to refresh '{path}': {reason}")]
        StaleEntry {
            path: BString,
            reason: crate::refresh::RefreshError,
        },

        #[error(transparent)]
        Lock(#[from] dirc_utils::UtilError),

        #[error(transparent)]
        Hash(#[from] dirc_hash::HashError),

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }

    impl IndexError {
        pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
            IndexError::Corrupt {
                reason: reason.into(),
            }
        }
    }
}

/// Merge stage for index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Resolved entry (stage 0).
    Normal,
    /// Common ancestor in a conflict (stage 1).
    Base,
    /// Our side of a conflict (stage 2).
    Ours,
    /// Their side of a conflict (stage 3).
    Theirs,
}

impl Stage {
    pub const CONFLICTED: [Stage; 3] = [Stage::Base, Stage::Ours, Stage::Theirs];

    pub fn as_u8(&self) -> u8 {
        match self {
            Stage::Normal => 0,
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, IndexError> {
        match n {
            0 => Ok(Stage::Normal),
            1 => Ok(Stage::Base),
            2 => Ok(Stage::Ours),
            3 => Ok(Stage::Theirs),
            _ => Err(IndexError::corrupt(format!("invalid stage: {n}"))),
        }
    }

    pub fn is_conflicted(&self) -> bool {
        *self != Stage::Normal
    }
}
