//! Request handlers.
//!
//! Every operation maps to one handler in a fixed table indexed by its
//! [`OpCode`]. Handlers run while the worker holds a reservation on the
//! connection's outbox, so a `LockPending` reply is always queued ahead of
//! the grant that follows it.

use std::sync::Arc;

use super::connection::Session;
use super::outbox::Outbox;
use super::ClientRegistry;
use crate::error::Result;
use crate::protocol::{OpCode, OpenFlags, Request, Response, Status, MAX_PATH};
use crate::storage::{ClientId, Evicted, LockOutcome, Orphan, Storage};
use crate::Error;

/// Everything produced by one request.
#[derive(Debug, Default)]
pub struct Reply {
    /// Responses for the requesting client, final status last.
    pub responses: Vec<Response>,
    /// Other clients whose awaited file disappeared.
    pub orphans: Vec<Orphan>,
    /// A lock was released, so waiters may be granted.
    pub released: bool,
    /// Close the connection once the responses are written.
    pub close: bool,
}

impl Reply {
    fn status(status: Status, path: &str) -> Self {
        Reply {
            responses: vec![Response::new(status).with_path(path)],
            ..Default::default()
        }
    }

    fn success(path: &str) -> Self {
        Reply::status(Status::Success, path)
    }

    /// Expelled files ahead of the final status.
    fn with_evicted(mut self, evicted: Evicted) -> Self {
        let mut responses: Vec<Response> = evicted
            .files
            .into_iter()
            .map(|file| {
                Response::new(Status::FilesExpelled)
                    .with_path(file.path)
                    .with_body(file.data)
            })
            .collect();
        responses.append(&mut self.responses);
        self.responses = responses;
        self.orphans.extend(evicted.orphans);
        self
    }

    pub fn error(err: &Error, path: &str) -> Self {
        Reply {
            responses: vec![Response::from_error(err, path)],
            ..Default::default()
        }
    }
}

/// State a handler may touch.
pub struct Call<'a> {
    pub client: ClientId,
    pub session: &'a mut Session,
    pub outbox: &'a Arc<Outbox>,
    pub storage: &'a Storage,
    pub registry: &'a ClientRegistry,
}

type Handler = fn(&mut Call<'_>, Request) -> Result<Reply>;

const HANDLERS: [Handler; 10] = [
    open_connection,
    close_connection,
    open_file,
    close_file,
    write_file,
    read_file,
    read_n_files,
    remove_file,
    lock_file,
    unlock_file,
];

fn handler(op: OpCode) -> Handler {
    HANDLERS[op.code() as usize - 1]
}

/// Runs one request. Failures become the final status of the reply.
pub fn dispatch(call: &mut Call<'_>, request: Request) -> Reply {
    let op = request.op;
    let path = request.path.clone();

    let result = check_session(call.session, &request).and_then(|()| handler(op)(call, request));
    match result {
        Ok(reply) => reply,
        Err(err) => {
            if err.status() == Status::InternalError {
                tracing::error!(client = call.client, op = %op, path = %path, error = %err, "Request failed");
            } else {
                tracing::debug!(client = call.client, op = %op, path = %path, error = %err, "Request rejected");
            }
            Reply::error(&err, &path)
        }
    }
}

fn check_session(session: &Session, request: &Request) -> Result<()> {
    match request.op {
        OpCode::OpenConnection => return Ok(()),
        _ if !session.is_active() => return Err(Error::NotConnected),
        _ => {}
    }

    if !request.op.targets_file() {
        return Ok(());
    }
    if request.path.is_empty() {
        return Err(Error::InvalidPath("empty path".into()));
    }
    if request.path.len() > MAX_PATH {
        return Err(Error::InvalidPath(format!(
            "{} bytes exceeds {}",
            request.path.len(),
            MAX_PATH
        )));
    }
    if request.op != OpCode::OpenFile && !session.is_open(&request.path) {
        return Err(Error::NotOpened(request.path.clone()));
    }
    Ok(())
}

fn lock_status(outcome: LockOutcome) -> Status {
    match outcome {
        LockOutcome::Acquired => Status::Success,
        LockOutcome::Queued => Status::LockPending,
    }
}

fn open_connection(call: &mut Call<'_>, _request: Request) -> Result<Reply> {
    call.session.activate()?;
    call.registry.register(call.client, call.outbox.clone());
    tracing::info!(client = call.client, "Client connected");
    Ok(Reply::success(""))
}

fn close_connection(call: &mut Call<'_>, _request: Request) -> Result<Reply> {
    tracing::info!(client = call.client, "Client disconnecting");
    Ok(Reply {
        close: true,
        ..Reply::success("")
    })
}

fn open_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let flags = request.flags()?;
    let lock = flags.contains(OpenFlags::LOCK);
    let path = request.path.as_str();

    let reply = if flags.contains(OpenFlags::CREATE) {
        let evicted = call.storage.create_file(path, call.client, lock)?;
        Reply::success(path).with_evicted(evicted)
    } else {
        match call.storage.open_file(path, call.client, lock)? {
            Some(outcome) => Reply::status(lock_status(outcome), path),
            None => Reply::success(path),
        }
    };

    call.session.mark_open(path);
    Ok(reply)
}

fn close_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let released = call.storage.close_file(&request.path, call.client);
    call.session.mark_closed(&request.path);
    Ok(Reply {
        released,
        ..Reply::success(&request.path)
    })
}

fn write_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let Request { path, body, .. } = request;
    let evicted = call.storage.write_file(&path, call.client, body)?;
    Ok(Reply::success(&path).with_evicted(evicted))
}

fn read_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let data = call.storage.read_file(&request.path, call.client)?;
    Ok(Reply {
        responses: vec![Response::success().with_path(request.path).with_body(data)],
        ..Default::default()
    })
}

fn read_n_files(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let n = request.count()?;
    let mut responses: Vec<Response> = call
        .storage
        .read_n_files(n, call.client)
        .into_iter()
        .map(|(path, data)| Response::success().with_path(path).with_body(data))
        .collect();
    // An empty path terminates the stream.
    responses.push(Response::success());

    Ok(Reply {
        responses,
        ..Default::default()
    })
}

fn remove_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let orphans = call.storage.remove_file(&request.path, call.client)?;
    call.session.mark_closed(&request.path);
    Ok(Reply {
        orphans,
        ..Reply::success(&request.path)
    })
}

fn lock_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    let outcome = call.storage.lock_file(&request.path, call.client)?;
    Ok(Reply::status(lock_status(outcome), &request.path))
}

fn unlock_file(call: &mut Call<'_>, request: Request) -> Result<Reply> {
    call.storage.unlock_file(&request.path, call.client)?;
    Ok(Reply {
        released: true,
        ..Reply::success(&request.path)
    })
}
