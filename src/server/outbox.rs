//! Outbound response queues.
//!
//! Every connection owns an [`Outbox`] drained by its own writer thread, so
//! only that thread ever writes to the socket. Workers, the lock manager and
//! orphan notifications just enqueue; a client that stops reading stalls
//! nothing but its own writer.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::protocol::{Response, ResponseEncoder};
use crate::queue::HandoffQueue;
use crate::Error;

pub struct Outbox {
    queue: HandoffQueue<Response>,
    /// Held by a worker while it serves a request, so responses from other
    /// threads queue behind the reply to that request.
    order: Mutex<()>,
}

/// Exclusive right to enqueue, taken before dispatch.
pub struct Reservation<'a> {
    queue: &'a HandoffQueue<Response>,
    _order: MutexGuard<'a, ()>,
}

impl Reservation<'_> {
    pub fn push(&self, response: Response) -> Result<()> {
        self.queue.push(response).map_err(|_| Error::PeerClosed)
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: HandoffQueue::new(),
            order: Mutex::new(()),
        }
    }

    /// Waits for any reservation in progress, then enqueues.
    pub fn send(&self, response: Response) -> Result<()> {
        self.reserve().push(response)
    }

    pub fn reserve(&self) -> Reservation<'_> {
        Reservation {
            queue: &self.queue,
            _order: self.order.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Refuses further responses. Those already queued are still written.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Encodes queued responses into `writer` until the outbox is closed and
    /// empty.
    pub fn drain_into<W: Write>(&self, writer: W) -> Result<()> {
        let mut encoder = ResponseEncoder::new(writer);
        while let Some(response) = self.queue.pop_draining() {
            encoder.encode(&response)?;
        }
        Ok(())
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
