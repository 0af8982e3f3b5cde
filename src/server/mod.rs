//! The file store server.
//!
//! Threads and what they own:
//!
//! - the multiplexer waits on the listener and every idle connection, and
//!   hands a connection to the workers when it becomes readable
//! - each worker serves one request of a connection, then gives it back
//! - every connection has a writer thread draining its outbox
//! - the lock manager grants released locks to waiting clients
//! - the stats task logs storage statistics
//!
//! The read side of a connection is owned by exactly one of these at a time.
//! Responses are only queued on the outbox, so nothing but a connection's
//! own writer ever blocks on a slow reader.

mod connection;
mod dispatch;
mod multiplexer;
mod outbox;
mod registry;
mod tasks;
mod worker;

pub use registry::ClientRegistry;

use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use itertools::Itertools;
use mio::{Poll, Waker};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::queue::HandoffQueue;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::Error;
use multiplexer::Multiplexer;
use tasks::{LockGrantTask, StatsTask};
use worker::WorkerContext;

/// How the server stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownMode {
    /// Stop accepting connections, exit once every client has disconnected.
    Graceful = 1,
    /// Close every connection now.
    Immediate = 2,
}

/// Shutdown request shared with the multiplexer.
pub struct Shutdown {
    mode: AtomicU8,
    waker: Arc<Waker>,
}

impl Shutdown {
    fn new(waker: Arc<Waker>) -> Self {
        Self {
            mode: AtomicU8::new(0),
            waker,
        }
    }

    /// An immediate request overrides a graceful one, never the reverse.
    pub fn request(&self, mode: ShutdownMode) -> io::Result<()> {
        self.mode.fetch_max(mode as u8, Ordering::SeqCst);
        self.waker.wake()
    }

    pub fn mode(&self) -> Option<ShutdownMode> {
        match self.mode.load(Ordering::SeqCst) {
            1 => Some(ShutdownMode::Graceful),
            2 => Some(ShutdownMode::Immediate),
            _ => None,
        }
    }
}

/// Removes the socket file when dropped.
struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// A bound but not yet running server.
pub struct Server {
    config: ServerConfig,
    listener: UnixListener,
    storage: Arc<Storage>,
    // Dropped in this order: socket file first, then the lock.
    socket: SocketFile,
    lock: FileLock,
}

impl Server {
    /// Binds the socket. Fails if another server holds the same socket path.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let socket_path = config.socket_path.clone();
        let lock = FileLock::lock(FileLock::path_for_socket(&socket_path))
            .map_err(Error::LockError)?;

        // Holding the lock means any socket file left here is stale.
        match fs::remove_file(&socket_path) {
            Ok(()) => tracing::info!(path = %socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&socket_path)?;
        let socket = SocketFile { path: socket_path };
        listener.set_nonblocking(true)?;

        tracing::info!(
            path = %socket.path.display(),
            workers = config.workers,
            max_files = config.storage.max_files,
            max_bytes = config.storage.max_bytes,
            evict_on = ?config.storage.evict_on,
            "Server bound"
        );

        Ok(Self {
            storage: Arc::new(Storage::new(config.storage.clone())),
            config,
            listener,
            socket,
            lock,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket.path
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Starts the multiplexer, the workers and the background tasks.
    pub fn spawn(self) -> Result<ServerHandle> {
        let Server {
            config,
            listener,
            storage,
            socket,
            lock,
        } = self;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), multiplexer::WAKER)?);
        let shutdown = Arc::new(Shutdown::new(waker.clone()));
        let queue = Arc::new(HandoffQueue::new());
        let registry = Arc::new(ClientRegistry::new());
        let (returns, returned) = mpsc::channel();

        let scheduler = Scheduler::new();
        let lock_trigger = scheduler.register(Arc::new(LockGrantTask::new(
            storage.clone(),
            registry.clone(),
            config.lock_scan_interval,
        )))?;
        scheduler.register(Arc::new(StatsTask::new(
            storage.clone(),
            config.stats_interval,
        )))?;

        let ctx = Arc::new(WorkerContext {
            storage: storage.clone(),
            registry,
            lock_trigger,
            returns,
            waker,
            max_body: worker::body_limit(config.storage.max_bytes),
        });

        let workers = (0..config.workers)
            .map(|i| {
                let queue = queue.clone();
                let ctx = ctx.clone();
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker::run(queue, ctx))
            })
            .collect::<io::Result<Vec<_>>>()?;

        let mut mux = Multiplexer::new(poll, listener, queue.clone(), returned, shutdown.clone())?;
        let multiplexer = thread::Builder::new()
            .name("multiplexer".to_string())
            .spawn(move || {
                let result = mux.run();
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Multiplexer failed");
                }
                // Releases the workers.
                queue.close();
                result
            })?;

        tracing::info!(workers = workers.len(), "Server running");

        Ok(ServerHandle {
            storage,
            shutdown,
            multiplexer,
            workers,
            scheduler,
            socket,
            _lock: lock,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    storage: Arc<Storage>,
    shutdown: Arc<Shutdown>,
    multiplexer: JoinHandle<io::Result<()>>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Scheduler,
    socket: SocketFile,
    _lock: FileLock,
}

impl ServerHandle {
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket.path
    }

    /// A handle that can request shutdown after `join` took the server.
    pub fn shutdown_hook(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        tracing::info!(?mode, "Shutdown requested");
        self.shutdown.request(mode)?;
        Ok(())
    }

    /// Waits for every thread to stop and logs the final summary.
    pub fn join(self) -> Result<()> {
        let multiplexed = self
            .multiplexer
            .join()
            .map_err(|_| Error::InvalidState("Multiplexer thread panicked".into()))?;

        for worker in self.workers {
            worker
                .join()
                .map_err(|_| Error::InvalidState("Worker thread panicked".into()))?;
        }
        self.scheduler.shutdown()?;

        let stats = self.storage.stats();
        tracing::info!(
            max_files_reached = stats.max_files_reached,
            max_bytes_reached = stats.max_bytes_reached,
            evictions = stats.evictions,
            files = stats.files,
            "Server stopped"
        );
        let remaining = self.storage.paths();
        if !remaining.is_empty() {
            tracing::info!(files = %remaining.iter().join(", "), "Files still stored");
        }

        multiplexed.map_err(Error::from)
    }
}
