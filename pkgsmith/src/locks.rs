//! Exclusive advisory locks backed by files under the store. One lock guards the database
//! (`db.lock`), one guards each build workdir (`locks/<id>.lock`). Locks are held for the
//! scope of the returned guard.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::warn;
use std::fs::{File, OpenOptions};
use std::path::Path;

#[derive(Debug)]
pub(crate) struct LockFile {
    file: Option<File>,
}

impl LockFile {
    /// Block until the exclusive lock at `path` is held.
    ///
    /// Never unlink a lock file that may still be held elsewhere: a second process could
    /// then create a fresh file at the same path and acquire a separate exclusive lock,
    /// defeating mutual exclusion. Lock files are left in place permanently.
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Unable to create lock dir '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .context(format!("Unable to open lock file '{}'", path.display()))?;

        // Filesystems without advisory lock support degrade to unlocked operation.
        match file.lock_exclusive() {
            Ok(()) => Ok(Self { file: Some(file) }),
            Err(err) => {
                warn!(
                    "Advisory locking unavailable for '{}' ({}); continuing without a lock",
                    path.display(),
                    err
                );
                Ok(Self { file: None })
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}
