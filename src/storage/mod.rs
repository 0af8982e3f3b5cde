//! In-memory file table with capacity limits and FIFO eviction.
//!
//! All state lives behind one mutex owned by [`Storage`]; callers only see
//! copies (contents, [`FileInfo`], [`StorageStats`]). Every operation takes
//! the mutex once, mutates, and returns whatever the caller has to send to
//! clients, so no I/O ever happens while the table is locked.
//!
//! # Eviction
//!
//! Files are evicted strictly in insertion order (oldest created first),
//! independent of access. The order is kept in a separate FIFO list so it is
//! unaffected by hash table layout. A file locked by a client other than the
//! one whose request triggered the eviction is skipped; if no eligible victim
//! remains the request fails with [`Error::StorageFull`].
//!
//! Victims are planned before anything is removed, so a request that cannot
//! be satisfied leaves the table untouched.
//!
//! # Invariants
//!
//! - `current_size` equals the sum of file sizes
//! - `no_of_files` equals the number of files in the table
//! - the FIFO list and the table hold the same set of paths

mod file;
mod lock;

pub use file::{File, LockOutcome};
pub use lock::LockGrant;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::StorageConfig;
use crate::error::Result;
use crate::Error;

/// Server-assigned identifier of a client connection.
pub type ClientId = u64;

/// A file removed to make room, sent back to the client whose request
/// caused the eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// A client left waiting on a lock for a file that no longer exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub client: ClientId,
    pub path: String,
}

/// Side effects of an operation that removed files.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evicted {
    pub files: Vec<EvictedFile>,
    pub orphans: Vec<Orphan>,
}

impl Evicted {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.orphans.is_empty()
    }
}

/// Point-in-time view of a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: usize,
    pub owner: Option<ClientId>,
    pub waiters: usize,
    pub created_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStats {
    pub files: usize,
    pub bytes: usize,
    pub max_files_reached: usize,
    pub max_bytes_reached: usize,
    pub evictions: u64,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, File>,
    fifo: VecDeque<String>,
    current_size: usize,
    no_of_files: usize,
    max_files_reached: usize,
    max_bytes_reached: usize,
    evictions: u64,
}

impl Inner {
    fn insert(&mut self, path: String, file: File) {
        self.current_size += file.size();
        self.fifo.push_back(path.clone());
        self.files.insert(path, file);
        self.no_of_files += 1;
        self.max_files_reached = self.max_files_reached.max(self.no_of_files);
        self.max_bytes_reached = self.max_bytes_reached.max(self.current_size);
    }

    /// Removes a file from the table and the FIFO list.
    fn take(&mut self, path: &str) -> Option<File> {
        let file = self.files.remove(path)?;
        if let Some(index) = self.fifo.iter().position(|p| p == path) {
            self.fifo.remove(index);
        }
        self.current_size -= file.size();
        self.no_of_files -= 1;
        Some(file)
    }

    /// Picks FIFO victims until at least `files` files and `bytes` bytes are
    /// freed. Returns `None` when the eligible files cannot free enough.
    fn plan_victims(
        &self,
        requester: ClientId,
        exclude: Option<&str>,
        files: usize,
        bytes: usize,
    ) -> Option<Vec<String>> {
        let mut victims = Vec::new();
        let (mut freed_files, mut freed_bytes) = (0, 0);

        for path in &self.fifo {
            if freed_files >= files && freed_bytes >= bytes {
                break;
            }
            if exclude == Some(path.as_str()) {
                continue;
            }
            let Some(file) = self.files.get(path) else {
                continue;
            };
            if file.locked_by_other(requester) {
                continue;
            }
            // Empty files free nothing when only bytes are short.
            if freed_files >= files && file.size() == 0 {
                continue;
            }
            freed_files += 1;
            freed_bytes += file.size();
            victims.push(path.clone());
        }

        (freed_files >= files && freed_bytes >= bytes).then_some(victims)
    }

    fn evict(&mut self, victims: Vec<String>) -> Evicted {
        let mut evicted = Evicted::default();

        for path in victims {
            let Some(mut file) = self.take(&path) else {
                continue;
            };
            self.evictions += 1;
            evicted
                .orphans
                .extend(file.take_waiters().into_iter().map(|client| Orphan {
                    client,
                    path: path.clone(),
                }));
            tracing::info!(path = %path, size = file.size(), "Evicted file");
            evicted.files.push(EvictedFile {
                path,
                data: file.into_data(),
            });
        }

        evicted
    }
}

/// The file store shared by every worker and the lock manager.
pub struct Storage {
    config: StorageConfig,
    inner: Mutex<Inner>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Creates an empty file at the FIFO tail, locked by `client` when `lock`
    /// is set. A full table evicts the oldest eligible file if the policy
    /// evicts on file count.
    pub fn create_file(&self, path: &str, client: ClientId, lock: bool) -> Result<Evicted> {
        let mut inner = self.lock();

        if inner.files.contains_key(path) {
            return Err(Error::FileExists(path.to_string()));
        }

        let mut evicted = Evicted::default();
        if inner.no_of_files >= self.config.max_files {
            if !self.config.evict_on.on_file_count() {
                return Err(Error::StorageFull);
            }
            let excess = inner.no_of_files + 1 - self.config.max_files;
            let victims = inner
                .plan_victims(client, None, excess, 0)
                .ok_or(Error::StorageFull)?;
            evicted = inner.evict(victims);
        }

        let owner = lock.then_some(client);
        inner.insert(path.to_string(), File::created(owner));
        tracing::debug!(client = client, path = %path, locked = lock, "Created file");

        Ok(evicted)
    }

    /// Opens an existing file, optionally asking for its lock.
    pub fn open_file(&self, path: &str, client: ClientId, lock: bool) -> Result<Option<LockOutcome>> {
        let mut inner = self.lock();
        let file = inner
            .files
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        Ok(lock.then(|| file.lock(client)))
    }

    /// First and only write of a file created by `client`, which must hold
    /// its lock.
    pub fn write_file(&self, path: &str, client: ClientId, data: Vec<u8>) -> Result<Evicted> {
        let mut inner = self.lock();

        let file = inner
            .files
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if data.is_empty() {
            return Err(Error::MissingBody);
        }
        if !file.is_created_empty() {
            return Err(Error::FileExists(path.to_string()));
        }
        if file.owner() != Some(client) {
            return Err(Error::NotLockOwner(path.to_string()));
        }

        let len = data.len();
        if len > self.config.max_bytes {
            return Err(Error::FileTooBig(len));
        }

        let mut evicted = Evicted::default();
        let needed = inner.current_size + len;
        if needed > self.config.max_bytes {
            if !self.config.evict_on.on_byte_size() {
                return Err(Error::FileTooBig(len));
            }
            let victims = inner
                .plan_victims(client, Some(path), 0, needed - self.config.max_bytes)
                .ok_or(Error::StorageFull)?;
            evicted = inner.evict(victims);
        }

        let inner = &mut *inner;
        let file = inner
            .files
            .get_mut(path)
            .ok_or_else(|| Error::InvalidState(format!("{} vanished during write", path)))?;
        inner.current_size += file.fill(data);
        inner.max_bytes_reached = inner.max_bytes_reached.max(inner.current_size);
        tracing::debug!(client = client, path = %path, size = len, "Wrote file");

        Ok(evicted)
    }

    pub fn read_file(&self, path: &str, client: ClientId) -> Result<Vec<u8>> {
        let inner = self.lock();
        let file = inner
            .files
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if file.locked_by_other(client) {
            return Err(Error::LockedByOther(path.to_string()));
        }
        Ok(file.data().to_vec())
    }

    /// Up to `n` readable files in FIFO order, every one when `n <= 0`.
    /// Files locked by other clients and files never written are skipped.
    pub fn read_n_files(&self, n: i64, client: ClientId) -> Vec<(String, Vec<u8>)> {
        let inner = self.lock();
        let limit = if n <= 0 { usize::MAX } else { n as usize };

        inner
            .fifo
            .iter()
            .filter_map(|path| inner.files.get(path).map(|file| (path, file)))
            .filter(|(_, file)| !file.locked_by_other(client) && !file.is_created_empty())
            .take(limit)
            .map(|(path, file)| (path.clone(), file.data().to_vec()))
            .collect()
    }

    /// Removes a file whose lock `client` holds. Clients waiting on its lock
    /// are returned as orphans.
    pub fn remove_file(&self, path: &str, client: ClientId) -> Result<Vec<Orphan>> {
        let mut inner = self.lock();
        let file = inner
            .files
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if file.owner() != Some(client) {
            return Err(Error::NotLockOwner(path.to_string()));
        }

        let mut file = inner
            .take(path)
            .ok_or_else(|| Error::InvalidState(format!("{} vanished during remove", path)))?;
        tracing::debug!(client = client, path = %path, "Removed file");

        Ok(file
            .take_waiters()
            .into_iter()
            .map(|client| Orphan {
                client,
                path: path.to_string(),
            })
            .collect())
    }

    pub fn get_file(&self, path: &str) -> Option<FileInfo> {
        let inner = self.lock();
        inner.files.get(path).map(|file| FileInfo {
            size: file.size(),
            owner: file.owner(),
            waiters: file.waiters().count(),
            created_empty: file.is_created_empty(),
        })
    }

    /// Paths in eviction order, oldest first.
    pub fn paths(&self) -> Vec<String> {
        self.lock().fifo.iter().cloned().collect()
    }

    pub fn stats(&self) -> StorageStats {
        let inner = self.lock();
        StorageStats {
            files: inner.no_of_files,
            bytes: inner.current_size,
            max_files_reached: inner.max_files_reached,
            max_bytes_reached: inner.max_bytes_reached,
            evictions: inner.evictions,
        }
    }

    /// Checks the accounting invariants of the table.
    pub fn validate_consistency(&self) -> Result<()> {
        let inner = self.lock();

        let size: usize = inner.files.values().map(File::size).sum();
        if size != inner.current_size {
            return Err(Error::InvalidState(format!(
                "Size mismatch: tracked {}, actual {}",
                inner.current_size, size
            )));
        }
        if inner.no_of_files != inner.files.len() || inner.fifo.len() != inner.files.len() {
            return Err(Error::InvalidState(format!(
                "Count mismatch: tracked {}, table {}, fifo {}",
                inner.no_of_files,
                inner.files.len(),
                inner.fifo.len()
            )));
        }
        if let Some(path) = inner.fifo.iter().find(|p| !inner.files.contains_key(*p)) {
            return Err(Error::InvalidState(format!(
                "FIFO entry without file: {}",
                path
            )));
        }
        if inner.current_size > self.config.max_bytes || inner.no_of_files > self.config.max_files
        {
            return Err(Error::InvalidState(format!(
                "Capacity exceeded: {} files, {} bytes",
                inner.no_of_files, inner.current_size
            )));
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
