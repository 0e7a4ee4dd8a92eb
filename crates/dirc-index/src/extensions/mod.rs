//! Index extensions: TREE (cache tree) and REUC (resolve undo).
//!
//! Every extension block is a 4-byte key, a u32 length and the payload. A
//! key we do not know is fatal when its first byte is an uppercase ASCII
//! letter and is skipped otherwise.

pub mod reuc;
pub mod tree;

/// Disposition of an extension block found while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    CacheTree,
    ResolveUndo,
    /// Unknown and safe to drop.
    Ignorable,
    /// Unknown and format-breaking.
    Required,
}

impl ExtensionKind {
    pub fn classify(signature: &[u8; 4]) -> Self {
        match signature {
            tree::CacheTree::SIGNATURE => ExtensionKind::CacheTree,
            reuc::SIGNATURE => ExtensionKind::ResolveUndo,
            sig if sig[0].is_ascii_uppercase() => ExtensionKind::Required,
            _ => ExtensionKind::Ignorable,
        }
    }
}
