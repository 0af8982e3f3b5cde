use std::collections::HashSet;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::net::Shutdown;
use std::sync::Arc;
use std::thread;

use mio::Token;

use super::outbox::Outbox;
use crate::storage::ClientId;
use crate::Error;

/// Per-connection protocol state.
#[derive(Debug, Default)]
pub enum Session {
    /// Connected at the socket level, `OpenConnection` not yet received.
    #[default]
    Uninitialized,
    Active {
        /// Paths opened by this client.
        open: HashSet<String>,
    },
}

impl Session {
    pub fn is_active(&self) -> bool {
        matches!(self, Session::Active { .. })
    }

    pub fn activate(&mut self) -> crate::Result<()> {
        if self.is_active() {
            return Err(Error::AlreadyConnected);
        }
        *self = Session::Active {
            open: HashSet::new(),
        };
        Ok(())
    }

    pub fn is_open(&self, path: &str) -> bool {
        match self {
            Session::Active { open } => open.contains(path),
            Session::Uninitialized => false,
        }
    }

    pub fn mark_open(&mut self, path: &str) {
        if let Session::Active { open } = self {
            open.insert(path.to_string());
        }
    }

    pub fn mark_closed(&mut self, path: &str) {
        if let Session::Active { open } = self {
            open.remove(path);
        }
    }
}

/// An accepted client socket. Exactly one thread owns it at a time: the
/// multiplexer while idle, a worker while a request is served. Writes go
/// through the outbox and its writer thread.
pub struct Connection {
    id: ClientId,
    stream: UnixStream,
    outbox: Arc<Outbox>,
    pub session: Session,
}

impl Connection {
    pub fn new(id: ClientId, stream: UnixStream) -> io::Result<Self> {
        // Workers read whole frames with blocking reads.
        stream.set_nonblocking(false)?;
        let outbox = Arc::new(Outbox::new());
        spawn_writer(id, stream.try_clone()?, outbox.clone())?;
        Ok(Self {
            id,
            stream,
            outbox,
            session: Session::default(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn token(&self) -> Token {
        Token(self.id as usize)
    }

    pub fn reader(&self) -> &UnixStream {
        &self.stream
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }
}

fn spawn_writer(id: ClientId, stream: UnixStream, outbox: Arc<Outbox>) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("conn-{id}-writer"))
        .spawn(move || {
            if let Err(e) = outbox.drain_into(&stream) {
                tracing::debug!(client = id, error = %e, "Writer stopped");
                outbox.close();
                let _ = stream.shutdown(Shutdown::Both);
            }
        })?;
    Ok(())
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The writer flushes what is queued, then exits.
        self.outbox.close();
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
