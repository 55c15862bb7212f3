use std::io::Write;
use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};

use crate::error::{PoolError, PoolResult};

/// Exclusive, non-blocking flock on the daemon's PID file. Held for the
/// daemon's entire lifetime; dropped (and the lock released) on shutdown.
/// A second daemon for the same socket fails to acquire it and exits rather
/// than stepping on the first one's state.
pub async fn acquire(path: PathBuf) -> PoolResult<Flock<std::fs::File>> {
    let path_for_err = path.clone();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().create(true).truncate(false).read(true).write(true).open(&path)?;

        let locked = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, errno)| {
            if errno == nix::errno::Errno::EWOULDBLOCK {
                PoolError::LockHeld { path: path.clone() }
            } else {
                PoolError::Io(std::io::Error::from_raw_os_error(errno as i32))
            }
        })?;

        let mut locked = locked;
        locked.set_len(0)?;
        locked.write_all(std::process::id().to_string().as_bytes())?;
        Ok(locked)
    })
    .await
    .map_err(|e| PoolError::Io(std::io::Error::other(format!("lock task: {e}"))))?
    .map_err(|e| match e {
        PoolError::LockHeld { .. } => PoolError::LockHeld { path: path_for_err },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_and_fills_pid_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("pool.lock");

        let guard = acquire(path.clone()).await.unwrap_or_else(|e| panic!("acquire: {e}"));
        let contents = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read: {e}"));
        assert_eq!(contents, std::process::id().to_string());
        drop(guard);
    }

    #[tokio::test]
    async fn second_acquire_on_held_lock_fails() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("pool.lock");

        let _guard = acquire(path.clone()).await.unwrap_or_else(|e| panic!("acquire: {e}"));
        let err = acquire(path).await.unwrap_err();
        assert!(matches!(err, PoolError::LockHeld { .. }));
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("pool.lock");

        let guard = acquire(path.clone()).await.unwrap_or_else(|e| panic!("acquire: {e}"));
        drop(guard);

        let _guard2 = acquire(path).await.unwrap_or_else(|e| panic!("reacquire: {e}"));
    }
}
