use std::sync::mpsc::Sender;
use std::sync::Arc;

use mio::Waker;

use super::connection::Connection;
use super::dispatch::{self, Call, Reply};
use super::registry::ClientRegistry;
use crate::protocol::{RequestDecoder, Response, Status, COUNT_LEN};
use crate::queue::HandoffQueue;
use crate::scheduler::Trigger;
use crate::storage::{ClientId, Orphan, Storage};
use crate::Error;

/// A connection given back to the multiplexer after one request.
pub enum Returned {
    /// Still open, watch it again.
    Rearm(Connection),
    /// Gone, with its session already cleaned up.
    Closed(ClientId),
}

/// State shared by all workers.
pub struct WorkerContext {
    pub storage: Arc<Storage>,
    pub registry: Arc<ClientRegistry>,
    pub lock_trigger: Trigger,
    pub returns: Sender<Returned>,
    pub waker: Arc<Waker>,
    pub max_body: u64,
}

/// Serves ready connections until the queue is closed.
pub fn run(queue: Arc<HandoffQueue<Connection>>, ctx: Arc<WorkerContext>) {
    while let Some(mut conn) = queue.pop() {
        let returned = if serve_one(&mut conn, &ctx) {
            Returned::Rearm(conn)
        } else {
            let id = conn.id();
            disconnect(conn, &ctx);
            Returned::Closed(id)
        };

        // The multiplexer is gone during shutdown; the connection just drops.
        if ctx.returns.send(returned).is_ok() {
            if let Err(e) = ctx.waker.wake() {
                tracing::warn!(error = %e, "Failed to wake multiplexer");
            }
        }
    }
    tracing::debug!("Worker exiting");
}

/// Largest request body accepted. Never below [`COUNT_LEN`], so control
/// bodies stay readable however small the store is.
pub fn body_limit(max_bytes: usize) -> u64 {
    max_bytes.max(COUNT_LEN) as u64
}

/// Reads and answers one request. Returns whether the connection stays open.
fn serve_one(conn: &mut Connection, ctx: &WorkerContext) -> bool {
    let client = conn.id();
    let decoded = RequestDecoder::new(conn.reader())
        .with_max_body(ctx.max_body)
        .decode();

    let outbox = conn.outbox().clone();
    let reservation = outbox.reserve();

    let reply = match decoded {
        Ok(request) => {
            tracing::trace!(client = client, op = %request.op, path = %request.path, "Request");
            let mut call = Call {
                client,
                session: &mut conn.session,
                outbox: &outbox,
                storage: &ctx.storage,
                registry: &ctx.registry,
            };
            dispatch::dispatch(&mut call, request)
        }
        Err(Error::PeerClosed) => {
            tracing::debug!(client = client, "Peer closed connection");
            return false;
        }
        Err(err @ (Error::BodyTooLarge(_) | Error::UnknownOpCode(_))) => {
            // The frame was consumed whole, so the stream is still in sync.
            tracing::warn!(client = client, error = %err, "Rejected request");
            Reply::error(&err, "")
        }
        Err(err) => {
            tracing::warn!(client = client, error = %err, "Dropping connection");
            let _ = reservation.push(Response::new(Status::BadRequest));
            return false;
        }
    };

    let queued = reply
        .responses
        .into_iter()
        .try_for_each(|response| reservation.push(response));
    drop(reservation);

    notify_orphans(&reply.orphans, &ctx.registry);
    if reply.released {
        ctx.lock_trigger.fire();
    }

    match queued {
        Ok(()) => !reply.close,
        Err(e) => {
            tracing::warn!(client = client, error = %e, "Failed to queue response");
            false
        }
    }
}

/// Tells waiters their file is gone. Runs with no reservation held.
fn notify_orphans(orphans: &[Orphan], registry: &ClientRegistry) {
    for orphan in orphans {
        let response = Response::new(Status::NotFound).with_path(orphan.path.as_str());
        if let Err(e) = registry.send(orphan.client, response) {
            tracing::debug!(client = orphan.client, path = %orphan.path, error = %e, "Orphan not notified");
        }
    }
}

/// Releases everything the client held.
fn disconnect(conn: Connection, ctx: &WorkerContext) {
    let client = conn.id();
    let released = ctx.storage.release_client(client);
    ctx.registry.unregister(client);
    if released > 0 {
        ctx.lock_trigger.fire();
    }
    tracing::info!(client = client, released_locks = released, "Client disconnected");
}
