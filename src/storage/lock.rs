//! Advisory per-file locks.
//!
//! Lock state lives on each [`File`](super::File): an optional owner and a
//! FIFO queue of waiting clients. Uncontended requests are granted inline.
//! Contended ones are queued and later granted by
//! [`Storage::grant_waiting_locks`], which the lock manager task calls after
//! every release. Grants and releases both run under the storage mutex, so a
//! lock is never handed out twice.

use super::{ClientId, LockOutcome, Storage};
use crate::error::Result;
use crate::Error;

/// A lock handed to a client that was waiting for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub client: ClientId,
    pub path: String,
}

impl Storage {
    pub fn lock_file(&self, path: &str, client: ClientId) -> Result<LockOutcome> {
        let mut inner = self.lock();
        let file = inner
            .files
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        let outcome = file.lock(client);
        tracing::debug!(client = client, path = %path, ?outcome, "Lock requested");
        Ok(outcome)
    }

    pub fn unlock_file(&self, path: &str, client: ClientId) -> Result<()> {
        let mut inner = self.lock();
        let file = inner
            .files
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        if !file.release(client) {
            return Err(Error::NotLockOwner(path.to_string()));
        }
        Ok(())
    }

    /// Drops whatever `client` holds or awaits on `path`. Returns whether a
    /// lock was released.
    pub fn close_file(&self, path: &str, client: ClientId) -> bool {
        let mut inner = self.lock();
        match inner.files.get_mut(path) {
            Some(file) => {
                file.remove_waiter(client);
                file.release(client)
            }
            None => false,
        }
    }

    /// Releases every lock `client` holds and withdraws it from every waiter
    /// queue. Returns the number of locks released.
    pub fn release_client(&self, client: ClientId) -> usize {
        let mut inner = self.lock();
        let mut released = 0;

        for file in inner.files.values_mut() {
            file.remove_waiter(client);
            if file.release(client) {
                released += 1;
            }
        }

        if released > 0 {
            tracing::debug!(client = client, released = released, "Released client locks");
        }
        released
    }

    /// Gives every free lock with waiters to the head of its queue. Files are
    /// visited in FIFO order.
    pub fn grant_waiting_locks(&self) -> Vec<LockGrant> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let mut grants = Vec::new();

        for path in &inner.fifo {
            let Some(file) = inner.files.get_mut(path) else {
                continue;
            };
            if let Some(client) = file.grant_next() {
                grants.push(LockGrant {
                    client,
                    path: path.clone(),
                });
            }
        }

        grants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::sync::Arc;
    use std::thread;

    fn storage_with(paths: &[&str]) -> Storage {
        let storage = Storage::new(StorageConfig::default());
        for path in paths {
            storage.create_file(path, 0, false).unwrap();
        }
        storage
    }

    #[test]
    fn test_uncontended_lock_is_granted_inline() {
        let storage = storage_with(&["/f"]);
        assert_eq!(storage.lock_file("/f", 1).unwrap(), LockOutcome::Acquired);
        assert_eq!(storage.get_file("/f").unwrap().owner, Some(1));
        assert!(matches!(
            storage.lock_file("/missing", 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_contended_lock_is_queued_then_granted_in_order() {
        let storage = storage_with(&["/f"]);
        storage.lock_file("/f", 1).unwrap();
        assert_eq!(storage.lock_file("/f", 2).unwrap(), LockOutcome::Queued);
        assert_eq!(storage.lock_file("/f", 3).unwrap(), LockOutcome::Queued);

        // Nothing to grant while the owner holds it.
        assert!(storage.grant_waiting_locks().is_empty());

        storage.unlock_file("/f", 1).unwrap();
        assert_eq!(
            storage.grant_waiting_locks(),
            vec![LockGrant {
                client: 2,
                path: "/f".into()
            }]
        );
        // Exactly one waiter per release.
        assert!(storage.grant_waiting_locks().is_empty());

        storage.unlock_file("/f", 2).unwrap();
        assert_eq!(storage.grant_waiting_locks()[0].client, 3);
        assert_eq!(storage.get_file("/f").unwrap().waiters, 0);
    }

    #[test]
    fn test_unlock_requires_owner() {
        let storage = storage_with(&["/f"]);
        storage.lock_file("/f", 1).unwrap();
        assert!(matches!(
            storage.unlock_file("/f", 2),
            Err(Error::NotLockOwner(_))
        ));
        storage.unlock_file("/f", 1).unwrap();
        assert!(matches!(
            storage.unlock_file("/f", 1),
            Err(Error::NotLockOwner(_))
        ));
    }

    #[test]
    fn test_close_file_releases_and_withdraws() {
        let storage = storage_with(&["/f", "/g"]);
        storage.lock_file("/f", 1).unwrap();
        storage.lock_file("/g", 2).unwrap();
        storage.lock_file("/g", 1).unwrap();

        assert!(storage.close_file("/f", 1));
        assert!(!storage.close_file("/g", 1));
        assert_eq!(storage.get_file("/g").unwrap().waiters, 0);
        assert!(!storage.close_file("/missing", 1));
    }

    #[test]
    fn test_release_client() {
        let storage = storage_with(&["/a", "/b", "/c"]);
        storage.lock_file("/a", 1).unwrap();
        storage.lock_file("/b", 1).unwrap();
        storage.lock_file("/c", 2).unwrap();
        storage.lock_file("/c", 1).unwrap();
        storage.lock_file("/a", 3).unwrap();

        assert_eq!(storage.release_client(1), 2);
        assert_eq!(storage.get_file("/c").unwrap().waiters, 0);

        let grants = storage.grant_waiting_locks();
        assert_eq!(
            grants,
            vec![LockGrant {
                client: 3,
                path: "/a".into()
            }]
        );
        assert_eq!(storage.get_file("/b").unwrap().owner, None);
    }

    #[test]
    fn test_concurrent_lockers_are_exclusive() {
        let storage = Arc::new(storage_with(&["/shared"]));

        let handles: Vec<_> = (1..=8u64)
            .map(|client| {
                let storage = storage.clone();
                thread::spawn(move || storage.lock_file("/shared", client).unwrap())
            })
            .collect();

        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == LockOutcome::Acquired)
            .count();
        assert_eq!(acquired, 1);
        assert_eq!(storage.get_file("/shared").unwrap().waiters, 7);

        // Drain the queue one release at a time.
        let mut owners = Vec::new();
        loop {
            let owner = storage.get_file("/shared").unwrap().owner.unwrap();
            owners.push(owner);
            storage.unlock_file("/shared", owner).unwrap();
            if storage.grant_waiting_locks().is_empty() {
                break;
            }
        }
        owners.sort();
        assert_eq!(owners, (1..=8).collect::<Vec<_>>());
    }
}
