//! Content hashes for the dirc index.
//!
//! Provides the fixed-width [`ContentHash`] recorded in every index entry,
//! the [`HashAlgorithm`] that decides its width, and a streaming [`Hasher`]
//! used for whole-file checksums and for re-hashing working-tree content.

mod algorithm;
mod error;
mod hash;
pub mod hasher;
pub mod hex;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use hash::ContentHash;
pub use hasher::{hash_blob, hash_file, Hasher};
