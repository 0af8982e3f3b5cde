use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::connection::Connection;
use super::worker::Returned;
use super::{Shutdown, ShutdownMode};
use crate::queue::HandoffQueue;
use crate::storage::ClientId;

pub const LISTENER: Token = Token(usize::MAX);
pub const WAKER: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 256;

/// Watches the listener and every idle connection, handing ready
/// connections to the workers.
pub struct Multiplexer {
    poll: Poll,
    listener: UnixListener,
    queue: Arc<HandoffQueue<Connection>>,
    returns: Receiver<Returned>,
    shutdown: Arc<Shutdown>,
    /// Connections waiting for input.
    idle: HashMap<Token, Connection>,
    /// Connections alive anywhere: idle, queued or being served.
    live: usize,
    next_id: ClientId,
    accepting: bool,
}

impl Multiplexer {
    pub fn new(
        poll: Poll,
        listener: UnixListener,
        queue: Arc<HandoffQueue<Connection>>,
        returns: Receiver<Returned>,
        shutdown: Arc<Shutdown>,
    ) -> io::Result<Self> {
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;

        Ok(Self {
            poll,
            listener,
            queue,
            returns,
            shutdown,
            idle: HashMap::new(),
            live: 0,
            next_id: 1,
            accepting: true,
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            self.drain_returns()?;

            match self.shutdown.mode() {
                Some(ShutdownMode::Immediate) => {
                    tracing::info!(live = self.live, "Multiplexer stopping");
                    break;
                }
                Some(ShutdownMode::Graceful) => {
                    if self.accepting {
                        self.stop_accepting()?;
                    }
                    if self.live == 0 {
                        tracing::info!("All clients gone, multiplexer stopping");
                        break;
                    }
                }
                None => {}
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    WAKER => {}
                    token => self.hand_off(token)?,
                }
            }
        }

        Ok(())
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Connections may still be pending behind the error, and
                    // the edge that reported them is spent.
                    tracing::warn!(error = %e, "Accept failed");
                    return self.rearm_listener();
                }
            };
            if !self.accepting {
                continue;
            }

            let id = self.next_id;
            self.next_id += 1;
            let conn = match Connection::new(id, stream) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(client = id, error = %e, "Failed to set up connection");
                    continue;
                }
            };

            self.watch(conn)?;
            self.live += 1;
            tracing::debug!(client = id, live = self.live, "Accepted connection");
        }
    }

    fn rearm_listener(&mut self) -> io::Result<()> {
        self.poll.registry().reregister(
            &mut SourceFd(&self.listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )
    }

    fn watch(&mut self, conn: Connection) -> io::Result<()> {
        let token = conn.token();
        self.poll.registry().register(
            &mut SourceFd(&conn.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;
        self.idle.insert(token, conn);
        Ok(())
    }

    /// Moves a ready connection to the workers. It is not watched again
    /// until a worker returns it.
    fn hand_off(&mut self, token: Token) -> io::Result<()> {
        let Some(conn) = self.idle.remove(&token) else {
            return Ok(());
        };
        self.poll
            .registry()
            .deregister(&mut SourceFd(&conn.as_raw_fd()))?;

        if let Err(conn) = self.queue.push(conn) {
            tracing::debug!(client = conn.id(), "Queue closed, dropping connection");
            self.live -= 1;
        }
        Ok(())
    }

    fn drain_returns(&mut self) -> io::Result<()> {
        loop {
            match self.returns.try_recv() {
                Ok(Returned::Rearm(conn)) => self.watch(conn)?,
                Ok(Returned::Closed(id)) => {
                    self.live -= 1;
                    tracing::debug!(client = id, live = self.live, "Connection closed");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn stop_accepting(&mut self) -> io::Result<()> {
        self.poll
            .registry()
            .deregister(&mut SourceFd(&self.listener.as_raw_fd()))?;
        self.accepting = false;
        tracing::info!(live = self.live, "Stopped accepting connections");
        Ok(())
    }
}
