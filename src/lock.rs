//! File-based locking for single-owner heaps.
//!
//! Advisory exclusive lock (fs2) on a side file next to the locked data file:
//! `<file>.lock`. A TransactionalHeap holds it for its whole lifetime, so a
//! second process (or a second open in this one) cannot replay the same
//! transaction store concurrently.
//!
//! Lock is released on Drop.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::debug;

use crate::error::{PmemError, Result};

pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // unlock errors on drop are ignored
        let _ = self.file.unlock();
        debug!("released {}", self.path.display());
    }
}

/// `<file>.lock`
pub fn lock_file_path(file: &Path) -> PathBuf {
    let mut s = file.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?)
}

/// Try to acquire the exclusive lock for `file`; IllegalState if another
/// owner holds it.
pub fn try_acquire_exclusive_lock(file: &Path) -> Result<LockGuard> {
    let path = lock_file_path(file);
    let f = open_lock_file(&path)?;
    if let Err(e) = f.try_lock_exclusive() {
        if e.kind() == fs2::lock_contended_error().kind() {
            return Err(PmemError::illegal_state(format!(
                "{} is locked by another owner",
                file.display()
            )));
        }
        return Err(e.into());
    }
    debug!("acquired {}", path.display());
    Ok(LockGuard { file: f, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_file_path(Path::new("/tmp/heap.bin")),
            PathBuf::from("/tmp/heap.bin.lock")
        );
    }
}
