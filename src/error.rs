use std::io;

use crate::protocol::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    // Wire codec
    PeerClosed,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    Malformed(String),
    UnknownOpCode(u32),
    UnknownStatus(u32),
    BodyTooLarge(u64),
    // Session
    NotConnected,
    AlreadyConnected,
    NotOpened(String),
    InvalidPath(String),
    InvalidRequest(String),
    // Storage
    NotFound(String),
    FileExists(String),
    NotLockOwner(String),
    LockedByOther(String),
    MissingBody,
    FileTooBig(usize),
    StorageFull,
    // Server lifecycle
    LockError(io::Error),
    InvalidConfig(String),
    InvalidState(String),
    // Reported by the server to a client
    Server { status: Status, path: String },
}

impl Error {
    /// Wire status reported to the client for this error.
    pub fn status(&self) -> Status {
        match self {
            Error::UnknownOpCode(_)
            | Error::Malformed(_)
            | Error::AlreadyConnected
            | Error::InvalidPath(_)
            | Error::InvalidRequest(_) => Status::BadRequest,
            Error::NotConnected
            | Error::NotOpened(_)
            | Error::NotLockOwner(_)
            | Error::LockedByOther(_) => Status::Unauthorized,
            Error::NotFound(_) => Status::NotFound,
            Error::FileExists(_) => Status::FileExists,
            Error::MissingBody => Status::MissingBody,
            Error::FileTooBig(_) | Error::BodyTooLarge(_) | Error::StorageFull => {
                Status::FileTooBig
            }
            Error::Server { status, .. } => *status,
            _ => Status::InternalError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::PeerClosed => write!(f, "Peer closed the connection"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
            Error::UnknownOpCode(code) => write!(f, "Unknown operation code: {}", code),
            Error::UnknownStatus(code) => write!(f, "Unknown status code: {}", code),
            Error::BodyTooLarge(len) => write!(f, "Body of {} bytes exceeds the limit", len),
            Error::NotConnected => write!(f, "Client not connected"),
            Error::AlreadyConnected => write!(f, "Client already connected"),
            Error::NotOpened(path) => write!(f, "File not opened by this client: {}", path),
            Error::InvalidPath(msg) => write!(f, "Invalid path: {}", msg),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::NotFound(path) => write!(f, "File not found: {}", path),
            Error::FileExists(path) => write!(f, "File already exists: {}", path),
            Error::NotLockOwner(path) => write!(f, "Lock not held on {}", path),
            Error::LockedByOther(path) => write!(f, "File locked by another client: {}", path),
            Error::MissingBody => write!(f, "Missing body"),
            Error::FileTooBig(len) => write!(f, "File of {} bytes exceeds storage capacity", len),
            Error::StorageFull => write!(f, "Storage full, no file can be evicted"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Server { status, path } if path.is_empty() => {
                write!(f, "Server replied {}", status.message())
            }
            Error::Server { status, path } => {
                write!(f, "Server replied {} for {}", status.message(), path)
            }
        }
    }
}

impl std::error::Error for Error {}
