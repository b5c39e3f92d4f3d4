//! Single-instance lock file.
//!
//! `<runtime>/hyprtavern/.ht-lock` holds the owning pid in ASCII plus a
//! trailing newline. A lock naming a live pid refuses startup; a stale
//! lock (dead pid) is replaced; an unreadable or unparseable lock is a
//! hard error, because guessing here could mean two taverns on one
//! socket.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

/// Lock file name under the runtime directory.
pub const LOCK_FILE_NAME: &str = ".ht-lock";

/// Why the lock could not be taken.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another tavern owns the lock and its pid is alive.
    #[error("hyprtavern already running for the current user")]
    AlreadyRunning,

    /// The lock exists but cannot be trusted; refuse to continue.
    #[error("lockfile corrupt or inaccessible: {0}")]
    Corrupt(String),

    /// Filesystem trouble creating the lock.
    #[error("failed to create a lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// A held lock; removed on [`LockFile::release`] (and best-effort on
/// drop).
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

/// Whether `pid` names a live process. `EPERM` counts as alive: the
/// process exists, it just is not ours.
fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

impl LockFile {
    /// Take the lock in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// [`LockError::AlreadyRunning`] on a live lock,
    /// [`LockError::Corrupt`] on an untrustworthy one, IO errors
    /// otherwise.
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);

        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| LockError::Corrupt(format!("lockfile exists but inaccessible: {e}")))?;

            let pid: i32 = content
                .trim()
                .parse()
                .map_err(|_| LockError::Corrupt("lockfile content is not a pid".into()))?;

            if pid_alive(pid) {
                return Err(LockError::AlreadyRunning);
            }

            debug!("removing stale lock of dead pid {pid}");
        }

        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            path,
            released: false,
        })
    }

    /// Remove the lock file.
    pub fn release(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::error!("failed to remove lock file: {e}");
            }
            self.released = true;
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = LockFile::acquire(dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));
    }

    #[test]
    fn live_pid_refuses_second_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = LockFile::acquire(dir.path()).unwrap();

        // Our own pid is in the lock and very much alive.
        assert!(matches!(
            LockFile::acquire(dir.path()),
            Err(LockError::AlreadyRunning)
        ));
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        // Pid from the far end of pid space; overwhelmingly likely dead.
        fs::write(dir.path().join(LOCK_FILE_NAME), "999999999\n").unwrap();

        let _lock = LockFile::acquire(dir.path()).unwrap();
        let content = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn garbage_lock_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), "not a pid\n").unwrap();

        assert!(matches!(
            LockFile::acquire(dir.path()),
            Err(LockError::Corrupt(_))
        ));
    }

    #[test]
    fn release_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = LockFile::acquire(dir.path()).unwrap();
        lock.release();

        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        // A second tavern may now start.
        let _lock = LockFile::acquire(dir.path()).unwrap();
    }
}
