use std::sync::Arc;
use std::time::Duration;

use super::registry::ClientRegistry;
use crate::error::Result;
use crate::protocol::Response;
use crate::scheduler::{BackgroundTask, Context};
use crate::storage::Storage;

/// Hands released locks to waiting clients and tells them with an
/// unsolicited `Success` carrying the path. Grants are only queued on the
/// waiter's outbox, so a client that stops reading delays nobody else.
pub struct LockGrantTask {
    storage: Arc<Storage>,
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl LockGrantTask {
    pub fn new(storage: Arc<Storage>, registry: Arc<ClientRegistry>, interval: Duration) -> Self {
        Self {
            storage,
            registry,
            interval,
        }
    }

    /// Grants every free lock with waiters. A grant that cannot be delivered
    /// is released and the scan repeated, so the next waiter gets it.
    pub fn grant_all(&self) -> usize {
        let mut delivered = 0;

        loop {
            let grants = self.storage.grant_waiting_locks();
            if grants.is_empty() {
                return delivered;
            }

            let mut undelivered = 0;
            for grant in grants {
                let response = Response::success().with_path(grant.path.as_str());
                match self.registry.send(grant.client, response) {
                    Ok(()) => {
                        delivered += 1;
                        tracing::debug!(client = grant.client, path = %grant.path, "Lock granted");
                    }
                    Err(e) => {
                        tracing::debug!(client = grant.client, path = %grant.path, error = %e, "Grant undeliverable");
                        // The client may already have released it on disconnect.
                        let _ = self.storage.unlock_file(&grant.path, grant.client);
                        undelivered += 1;
                    }
                }
            }

            if undelivered == 0 {
                return delivered;
            }
        }
    }
}

impl BackgroundTask for LockGrantTask {
    fn name(&self) -> &'static str {
        "lock-manager"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self, ctx: Context) -> Result<()> {
        let granted = self.grant_all();
        if granted > 0 {
            tracing::trace!(run = ctx.run_id, triggered = ctx.triggered, granted, "Lock scan");
        }
        Ok(())
    }
}

/// Logs storage statistics and checks the accounting invariants.
pub struct StatsTask {
    storage: Arc<Storage>,
    interval: Duration,
}

impl StatsTask {
    pub fn new(storage: Arc<Storage>, interval: Duration) -> Self {
        Self { storage, interval }
    }
}

impl BackgroundTask for StatsTask {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execute(&self, _ctx: Context) -> Result<()> {
        let stats = self.storage.stats();
        tracing::info!(
            files = stats.files,
            bytes = stats.bytes,
            max_files_reached = stats.max_files_reached,
            max_bytes_reached = stats.max_bytes_reached,
            evictions = stats.evictions,
            "Storage stats"
        );
        self.storage.validate_consistency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::protocol::{ResponseDecoder, Status};
    use crate::server::outbox::Outbox;

    fn task() -> LockGrantTask {
        LockGrantTask::new(
            Arc::new(Storage::new(StorageConfig::default())),
            Arc::new(ClientRegistry::new()),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_grant_is_delivered() {
        let task = task();
        let outbox = Arc::new(Outbox::new());
        task.registry.register(2, outbox.clone());

        task.storage.create_file("/f", 1, true).unwrap();
        task.storage.lock_file("/f", 2).unwrap();
        assert_eq!(task.grant_all(), 0);

        task.storage.unlock_file("/f", 1).unwrap();
        assert_eq!(task.grant_all(), 1);

        outbox.close();
        let mut buf = Vec::new();
        outbox.drain_into(&mut buf).unwrap();
        let response = ResponseDecoder::new(buf.as_slice()).decode().unwrap();
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.path, "/f");
        assert_eq!(task.storage.get_file("/f").unwrap().owner, Some(2));
    }

    #[test]
    fn test_missing_waiter_is_skipped() {
        let task = task();
        task.registry.register(3, Arc::new(Outbox::new()));

        task.storage.create_file("/f", 1, true).unwrap();
        // Client 2 queued but never registered, client 3 behind it.
        task.storage.lock_file("/f", 2).unwrap();
        task.storage.lock_file("/f", 3).unwrap();
        task.storage.unlock_file("/f", 1).unwrap();

        assert_eq!(task.grant_all(), 1);
        assert_eq!(task.storage.get_file("/f").unwrap().owner, Some(3));
    }

    #[test]
    fn test_closed_outbox_passes_grant_on() {
        let task = task();
        let gone = Arc::new(Outbox::new());
        gone.close();
        task.registry.register(2, gone);
        task.registry.register(3, Arc::new(Outbox::new()));

        task.storage.create_file("/f", 1, true).unwrap();
        task.storage.lock_file("/f", 2).unwrap();
        task.storage.lock_file("/f", 3).unwrap();
        task.storage.unlock_file("/f", 1).unwrap();

        assert_eq!(task.grant_all(), 1);
        assert_eq!(task.storage.get_file("/f").unwrap().owner, Some(3));
    }

    #[test]
    fn test_stats_task_validates() {
        let storage = Arc::new(Storage::new(StorageConfig::default()));
        storage.create_file("/f", 1, false).unwrap();

        let task = StatsTask::new(storage, Duration::from_secs(1));
        let ctx = Context {
            task_name: task.name(),
            run_id: 1,
            triggered: false,
        };
        task.execute(ctx).unwrap();
    }
}
