//! Index configuration.

use dirc_hash::HashAlgorithm;

use crate::resolve_undo::ResolveUndoMode;

pub const DEFAULT_VERSION: u32 = 3;

/// Knobs that affect how entries are compared and how the index is stored.
///
/// Mirrors the relevant `core.*` and `index.*` settings; callers that read a
/// repository config translate it into this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Format written when the state carries no version of its own.
    pub version: u32,
    pub hash_algorithm: HashAlgorithm,
    /// `core.filemode`
    pub trust_executable_bit: bool,
    /// `core.symlinks`
    pub has_symlinks: bool,
    /// `core.trustctime`
    pub trust_ctime: bool,
    /// Compare `st_dev` as well as the inode.
    pub check_dev: bool,
    /// Compare sub-second timestamps.
    pub use_nsec: bool,
    /// `core.ignorestat`: freshly filled entries are marked VALID.
    pub assume_unchanged: bool,
    /// Skip verification of the trailing checksum on load.
    pub skip_hash_check: bool,
    /// Representation chosen for resolve-undo data of new or loaded states.
    pub resolve_undo_mode: ResolveUndoMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            hash_algorithm: HashAlgorithm::Sha1,
            trust_executable_bit: true,
            has_symlinks: true,
            trust_ctime: true,
            check_dev: false,
            use_nsec: true,
            assume_unchanged: false,
            skip_hash_check: false,
            resolve_undo_mode: ResolveUndoMode::Separate,
        }
    }
}

impl IndexConfig {
    /// Defaults with `GIT_INDEX_VERSION` applied when it names a supported version.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("GIT_INDEX_VERSION") {
            match parse_version(&value) {
                Some(v) => config.version = v,
                None => tracing::warn!(
                    value = %value,
                    "GIT_INDEX_VERSION set, but the value is invalid; using version {}",
                    config.version
                ),
            }
        }
        config
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_hash_algorithm(mut self, algo: HashAlgorithm) -> Self {
        self.hash_algorithm = algo;
        self
    }

    pub fn with_resolve_undo_mode(mut self, mode: ResolveUndoMode) -> Self {
        self.resolve_undo_mode = mode;
        self
    }

    pub fn with_trust_ctime(mut self, trust: bool) -> Self {
        self.trust_ctime = trust;
        self
    }

    pub fn with_skip_hash_check(mut self, skip: bool) -> Self {
        self.skip_hash_check = skip;
        self
    }
}

pub(crate) fn parse_version(value: &str) -> Option<u32> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|v| (2..=5).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.version, 3);
        assert!(config.trust_ctime);
        assert!(!config.check_dev);
        assert_eq!(config.resolve_undo_mode, ResolveUndoMode::Separate);
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version("4"), Some(4));
        assert_eq!(parse_version(" 5\n"), Some(5));
        assert_eq!(parse_version("1"), None);
        assert_eq!(parse_version("6"), None);
        assert_eq!(parse_version("four"), None);
    }

    #[test]
    fn builder_setters() {
        let config = IndexConfig::default()
            .with_version(5)
            .with_hash_algorithm(HashAlgorithm::Sha256)
            .with_resolve_undo_mode(ResolveUndoMode::InIndex);
        assert_eq!(config.version, 5);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.resolve_undo_mode, ResolveUndoMode::InIndex);
    }
}
