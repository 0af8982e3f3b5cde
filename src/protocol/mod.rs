//! Wire protocol spoken between clients and the server.
//!
//! Every exchange is a length-prefixed frame on a persistent stream socket,
//! so bodies can carry arbitrary binary content:
//!
//! ```text
//! request:  | op u32 | path_len u64 | path | body_len u64 | body |
//! response: | status u32 | phrase [u8; 64] | path_len u64 | path | body_len u64 | body |
//! ```
//!
//! Integers are native-endian. The phrase field is the NUL-padded
//! human-readable form of the status.
//!
//! One request may be answered by several responses: evicted files are sent
//! as `FilesExpelled` responses ahead of the final status, `ReadNFiles`
//! streams one response per file, and a lock hand-off arrives as an
//! unsolicited `Success` outside any request.

pub mod codec;

pub use codec::{
    RequestDecoder, RequestEncoder, ResponseDecoder, ResponseEncoder, MAX_PATH, PHRASE_LEN,
};

use byteorder::{ByteOrder, NativeEndian};
use std::fmt;
use std::ops::BitOr;

use crate::error::Result;
use crate::Error;

/// Width of the `ReadNFiles` count body, the largest control body on the wire.
pub const COUNT_LEN: usize = 8;

/// Operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpCode {
    OpenConnection = 1,
    CloseConnection = 2,
    OpenFile = 3,
    CloseFile = 4,
    WriteFile = 5,
    ReadFile = 6,
    ReadNFiles = 7,
    RemoveFile = 8,
    LockFile = 9,
    UnlockFile = 10,
}

impl OpCode {
    pub const ALL: [OpCode; 10] = [
        OpCode::OpenConnection,
        OpCode::CloseConnection,
        OpCode::OpenFile,
        OpCode::CloseFile,
        OpCode::WriteFile,
        OpCode::ReadFile,
        OpCode::ReadNFiles,
        OpCode::RemoveFile,
        OpCode::LockFile,
        OpCode::UnlockFile,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Whether the operation addresses a single file by path.
    pub fn targets_file(self) -> bool {
        !matches!(
            self,
            OpCode::OpenConnection | OpCode::CloseConnection | OpCode::ReadNFiles
        )
    }
}

impl TryFrom<u32> for OpCode {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| op.code() == code)
            .ok_or(Error::UnknownOpCode(code))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::OpenConnection => "OPEN_CONNECTION",
            OpCode::CloseConnection => "CLOSE_CONNECTION",
            OpCode::OpenFile => "OPEN_FILE",
            OpCode::CloseFile => "CLOSE_FILE",
            OpCode::WriteFile => "WRITE_FILE",
            OpCode::ReadFile => "READ_FILE",
            OpCode::ReadNFiles => "READ_N_FILES",
            OpCode::RemoveFile => "REMOVE_FILE",
            OpCode::LockFile => "LOCK_FILE",
            OpCode::UnlockFile => "UNLOCK_FILE",
        };
        f.write_str(name)
    }
}

/// Status carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    InternalError = 1,
    BadRequest = 2,
    NotFound = 3,
    Unauthorized = 4,
    MissingBody = 5,
    FileTooBig = 6,
    /// Informational, precedes the final status of the same request.
    FilesExpelled = 7,
    FileExists = 8,
    /// The lock is held by someone else; a `Success` follows once granted.
    LockPending = 9,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Success,
        Status::InternalError,
        Status::BadRequest,
        Status::NotFound,
        Status::Unauthorized,
        Status::MissingBody,
        Status::FileTooBig,
        Status::FilesExpelled,
        Status::FileExists,
        Status::LockPending,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human-readable phrase for diagnostics.
    pub fn message(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::InternalError => "internal server error",
            Status::BadRequest => "bad request",
            Status::NotFound => "file not found",
            Status::Unauthorized => "unauthorized",
            Status::MissingBody => "missing body",
            Status::FileTooBig => "file too big",
            Status::FilesExpelled => "files expelled",
            Status::FileExists => "file already exists",
            Status::LockPending => "lock pending",
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl TryFrom<u32> for Status {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.code() == code)
            .ok_or(Error::UnknownStatus(code))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Flags accepted by `OpenFile`, sent as a u32 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    pub const CREATE: OpenFlags = OpenFlags(1);
    pub const LOCK: OpenFlags = OpenFlags(2);

    const MASK: u32 = 0b11;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::MASK == 0).then_some(OpenFlags(bits))
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: OpCode,
    pub path: String,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(op: OpCode, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn open_file(path: impl Into<String>, flags: OpenFlags) -> Self {
        let mut body = vec![0u8; 4];
        NativeEndian::write_u32(&mut body, flags.bits());
        Request::new(OpCode::OpenFile, path).with_body(body)
    }

    pub fn read_n_files(n: i64) -> Self {
        let mut body = vec![0u8; COUNT_LEN];
        NativeEndian::write_i64(&mut body, n);
        Request::new(OpCode::ReadNFiles, "").with_body(body)
    }

    /// Flags of an `OpenFile` request. An empty body means no flags.
    pub fn flags(&self) -> Result<OpenFlags> {
        match self.body.len() {
            0 => Ok(OpenFlags::NONE),
            4 => OpenFlags::from_bits(NativeEndian::read_u32(&self.body)).ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "unknown open flags {:#x}",
                    NativeEndian::read_u32(&self.body)
                ))
            }),
            len => Err(Error::InvalidRequest(format!(
                "open flags must be 4 bytes, got {}",
                len
            ))),
        }
    }

    /// File count of a `ReadNFiles` request; `<= 0` means every file.
    pub fn count(&self) -> Result<i64> {
        match self.body.len() {
            0 => Ok(0),
            COUNT_LEN => Ok(NativeEndian::read_i64(&self.body)),
            len => Err(Error::InvalidRequest(format!(
                "file count must be 8 bytes, got {}",
                len
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub path: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            path: String::new(),
            body: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Response::new(Status::Success)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final response for a failed request.
    pub fn from_error(err: &Error, path: &str) -> Self {
        Response::new(err.status()).with_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_codes_are_stable() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::try_from(op.code()).unwrap(), op);
        }
        assert_eq!(OpCode::OpenConnection.code(), 1);
        assert_eq!(OpCode::UnlockFile.code(), 10);
        assert!(matches!(
            OpCode::try_from(0),
            Err(Error::UnknownOpCode(0))
        ));
        assert!(matches!(
            OpCode::try_from(11),
            Err(Error::UnknownOpCode(11))
        ));
    }

    #[test]
    fn test_status_lookup() {
        assert_eq!(Status::try_from(7).unwrap(), Status::FilesExpelled);
        assert_eq!(Status::NotFound.message(), "file not found");
        assert!(Status::Success.is_success());
        assert!(!Status::LockPending.is_success());
        assert!(Status::try_from(42).is_err());
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::CREATE | OpenFlags::LOCK;
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(flags.contains(OpenFlags::LOCK));
        assert!(!OpenFlags::CREATE.contains(OpenFlags::LOCK));
        assert!(OpenFlags::from_bits(4).is_none());

        let request = Request::open_file("/a", flags);
        assert_eq!(request.flags().unwrap(), flags);

        let no_body = Request::new(OpCode::OpenFile, "/a");
        assert_eq!(no_body.flags().unwrap(), OpenFlags::NONE);

        let bad = Request::new(OpCode::OpenFile, "/a").with_body(vec![1, 2]);
        assert!(matches!(bad.flags(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_read_n_count() {
        assert_eq!(Request::read_n_files(3).count().unwrap(), 3);
        assert_eq!(Request::read_n_files(-1).count().unwrap(), -1);
        assert_eq!(
            Request::new(OpCode::ReadNFiles, "").count().unwrap(),
            0
        );
    }

    #[test]
    fn test_response_from_error() {
        let response = Response::from_error(&Error::NotOpened("/x".into()), "/x");
        assert_eq!(response.status, Status::Unauthorized);
        assert_eq!(response.path, "/x");
        assert!(response.body.is_empty());
    }
}
