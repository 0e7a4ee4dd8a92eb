pub mod crc;
pub mod error;
pub mod lockfile;
pub mod varint;

pub use error::{LockError, UtilError};

pub type Result<T> = std::result::Result<T, UtilError>;
