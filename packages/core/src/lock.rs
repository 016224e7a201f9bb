//! Per-stash single-flight lock.
//!
//! Operations on the same stash are serialized with an exclusive advisory
//! lock on a file in the stash config directory. The lock is tied to the open
//! file description, so it serializes threads of one process as well as
//! separate processes. It is released when the guard is dropped.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, IoResultExt, Result};

/// Held exclusive lock on one stash.
#[derive(Debug)]
pub struct StashLock {
    _guard: Flock<File>,
    path: PathBuf,
}

impl StashLock {
    /// Blocks until the lock is available.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::Lock {
                path: path.to_path_buf(),
                message: errno.desc().to_string(),
            }
        })?;
        Ok(Self {
            _guard: guard,
            path: path.to_path_buf(),
        })
    }

    /// Takes the lock if it is free, returns `None` when another holder has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(Self {
                _guard: guard,
                path: path.to_path_buf(),
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Lock {
                path: path.to_path_buf(),
                message: errno.desc().to_string(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .file_context(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".lock");

        let held = StashLock::acquire(&path).unwrap();
        assert!(StashLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(StashLock::try_acquire(&path).unwrap().is_some());
    }
}
