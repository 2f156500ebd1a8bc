//! The process-wide advisory lock serializing cooperating invocations.
//!
//! Acquisition blocks without timeout: correctness over liveness. The
//! holder's PID is recorded in the lock file to assist debugging; the file
//! is truncated again on release.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".lock";

/// Held for the scope of any invasive manager call; releases on drop.
#[derive(Debug)]
pub struct SpoolLock {
    file: File,
    path: PathBuf,
}

impl SpoolLock {
    /// Acquires the exclusive lock, blocking until it is free.
    pub fn acquire(spooldir: &Path) -> io::Result<SpoolLock> {
        let path = spooldir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        tracing::debug!(lock = %path.display(), "spool-lock-acquired");
        Ok(SpoolLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        // Best effort: leaving a stale PID behind is cosmetic, the flock
        // itself dies with the file handle.
        let _ = self.file.set_len(0);
        let _ = fs2::FileExt::unlock(&self.file);
        tracing::debug!(lock = %self.path.display(), "spool-lock-released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_records_pid_and_truncates_on_release() {
        let dir = tempdir().unwrap();
        {
            let lock = SpoolLock::acquire(dir.path()).unwrap();
            let content = std::fs::read_to_string(lock.path()).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(content, "");
    }

    #[test]
    fn reacquire_after_release() {
        let dir = tempdir().unwrap();
        drop(SpoolLock::acquire(dir.path()).unwrap());
        drop(SpoolLock::acquire(dir.path()).unwrap());
    }
}
