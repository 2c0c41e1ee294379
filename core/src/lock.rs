//! Advisory cross-process file locks over the shared cache.
//!
//! The per-cwd serialization lock is a plain `flock(2)` on a file under
//! `locks/`. The lock file itself is never removed; only the advisory lock
//! state matters. The OS releases the lock when the holding process dies,
//! which is the load-bearing assumption on the shared filesystem — probed
//! at worker start so a cache without working flock fails loudly instead
//! of silently interleaving same-cwd sessions.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use crate::error::LockError;

/// RAII guard for a held lock. Dropping the guard closes the descriptor,
/// which releases the flock.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquires the lock, blocking until it is available.
///
/// Call through `spawn_blocking` from async contexts; the wait can be
/// unbounded while another session holds the same cwd.
pub fn acquire_blocking(path: &Path) -> Result<LockGuard, LockError> {
    let file = open_lock_file(path)?;
    flock(&file, libc::LOCK_EX).map_err(|source| LockError::Flock {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(LockGuard {
        _file: file,
        path: path.to_path_buf(),
    })
}

/// Attempts the lock without blocking; `None` means another process holds
/// it.
pub fn try_acquire(path: &Path) -> Result<Option<LockGuard>, LockError> {
    let file = open_lock_file(path)?;
    match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(Some(LockGuard {
            _file: file,
            path: path.to_path_buf(),
        })),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(source) => Err(LockError::Flock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Verifies that `flock` works inside `dir` by taking and releasing a
/// probe lock. Failure is fatal for the worker.
pub fn probe_support(dir: &Path) -> Result<(), LockError> {
    let probe = dir.join(".flock-probe");
    let guard = acquire_blocking(&probe).map_err(|_| LockError::Unsupported {
        path: dir.to_path_buf(),
    })?;
    drop(guard);
    Ok(())
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(unix)]
fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    loop {
        // SAFETY: `fd` comes from an open `File` that outlives this call;
        // LOCK_EX / LOCK_NB are valid flock operations.
        let rc = unsafe { libc::flock(fd, operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
        }
        return Err(err);
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _operation: libc::c_int) -> io::Result<()> {
    // Single-host fallback: no advisory locking off Unix.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("cwd.lock");

        {
            let guard = acquire_blocking(&path).expect("acquire");
            assert_eq!(guard.path(), path);
        }
        // Released on drop; a second blocking acquire succeeds immediately.
        let _guard = acquire_blocking(&path).expect("re-acquire");
    }

    #[cfg(unix)]
    #[test]
    fn try_acquire_reports_would_block_while_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("cwd.lock");

        let held = acquire_blocking(&path).expect("acquire");
        // flock is per-open-file, so a second open in this process still
        // contends.
        let second = try_acquire(&path).expect("try");
        assert!(second.is_none(), "lock should read as held");

        drop(held);
        let third = try_acquire(&path).expect("try after release");
        assert!(third.is_some());
    }

    #[test]
    fn lock_file_is_not_removed_on_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("cwd.lock");
        drop(acquire_blocking(&path).expect("acquire"));
        assert!(path.exists(), "lock file persists; lock state is advisory");
    }

    #[test]
    fn probe_passes_on_a_local_filesystem() {
        let tmp = tempfile::tempdir().expect("tempdir");
        probe_support(tmp.path()).expect("flock support");
    }
}
