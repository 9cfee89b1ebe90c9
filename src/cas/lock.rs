//! Per-object advisory locks.
//!
//! `put` holds an exclusive lock on `locks/<digest>.lock` while it checks
//! for and writes an object; `gc` takes the same lock without blocking and
//! skips the object when it is busy.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct ObjectLock {
    path: PathBuf,
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl ObjectLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Blocks until the lock is held.
#[cfg(unix)]
pub fn acquire(path: &Path) -> io::Result<ObjectLock> {
    use nix::fcntl::{Flock, FlockArg};
    let file = open_lock_file(path)?;
    let guard = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io::Error::from_raw_os_error(errno as i32))?;
    Ok(ObjectLock {
        path: path.to_path_buf(),
        _guard: guard,
    })
}

/// `Ok(None)` when someone else holds the lock.
#[cfg(unix)]
pub fn try_acquire(path: &Path) -> io::Result<Option<ObjectLock>> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    let file = open_lock_file(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => Ok(Some(ObjectLock {
            path: path.to_path_buf(),
            _guard: guard,
        })),
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

#[cfg(not(unix))]
pub fn acquire(path: &Path) -> io::Result<ObjectLock> {
    Ok(ObjectLock {
        path: path.to_path_buf(),
        _file: open_lock_file(path)?,
    })
}

#[cfg(not(unix))]
pub fn try_acquire(path: &Path) -> io::Result<Option<ObjectLock>> {
    acquire(path).map(Some)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_try_acquire_sees_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/abc.lock");
        let held = acquire(&path).unwrap();
        assert!(try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(try_acquire(&path).unwrap().is_some());
    }
}
