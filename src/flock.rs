use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a file next to the server socket, so two
/// servers never bind the same socket path.
///
/// Dropping closes the descriptor, which releases the flock. The lock file
/// itself stays: unlinking it would let a contender that already opened it
/// lock the orphaned inode while a newcomer locks a fresh one.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and locks it without blocking.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Only rewrite the pid once we own the lock.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Lock path used for a given socket path.
    pub fn path_for_socket(socket_path: &Path) -> PathBuf {
        let mut name = socket_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("server.lock");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());

        let content = std::fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("server.lock");

        let _lock1 = FileLock::lock(&lock_path).expect("Failed to acquire first lock");

        // flock is per open file description, so a second open conflicts even
        // inside one process.
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("server.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
            assert!(lock_path.exists());
        }
        assert!(lock_path.exists());

        let _lock2 = FileLock::lock(&lock_path).expect("Should be able to lock after drop");
    }

    #[test]
    fn test_contender_opened_before_release_still_conflicts() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("server.lock");

        let first = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        // Opened while the first holder is alive, locked only after.
        let contender = File::open(&lock_path).unwrap();
        drop(first);

        let _second = FileLock::lock(&lock_path).expect("Failed to lock after release");
        assert!(FileLock::try_lock(&contender).is_err());
    }

    #[test]
    fn test_path_for_socket() {
        assert_eq!(
            FileLock::path_for_socket(Path::new("/run/fs.sock")),
            PathBuf::from("/run/fs.sock.lock")
        );
    }
}
