use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{LockError, UtilError};
use crate::Result;

/// Exclusive `<path>.lock` file holding the next version of `path`.
///
/// A second writer fails instead of waiting. [`commit`](LockFile::commit)
/// renames the lock over the target; an uncommitted lock is deleted on drop
/// and the target is left as it was.
pub struct LockFile {
    path: PathBuf,
    lock_path: PathBuf,
    /// `None` once committed or rolled back.
    file: Option<File>,
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

impl LockFile {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        let file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::AlreadyLocked { path: lock_path }.into());
            }
            Err(source) => return Err(LockError::Create { path: lock_path, source }.into()),
        };
        tracing::trace!(lock = %lock_path.display(), "acquired lock");
        Ok(Self {
            path,
            lock_path,
            file: Some(file),
        })
    }

    /// `Ok(None)` when another writer holds the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        match Self::acquire(path) {
            Ok(lock) => Ok(Some(lock)),
            Err(UtilError::Lock(LockError::AlreadyLocked { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The file replaced on commit.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn live(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))
    }

    /// Flush, fsync and rename the lock over the target.
    pub fn commit(mut self) -> Result<()> {
        let result = self.finish();
        result.map_err(|source| {
            LockError::Commit {
                path: self.lock_path.clone(),
                source,
            }
            .into()
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        let file = self.live()?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&self.lock_path, &self.path)?;
        self.file = None;
        Ok(())
    }

    /// Remove the lock and keep the target. Dropping does the same.
    pub fn rollback(mut self) -> Result<()> {
        if self.file.take().is_some() {
            fs::remove_file(&self.lock_path)?;
        }
        Ok(())
    }
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.live()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.live()?.flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
