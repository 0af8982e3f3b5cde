//! Blocking client for the file store.
//!
//! Each method sends one request and reads responses until the final status
//! of that request. `FilesExpelled` responses are collected and returned to
//! the caller, and a `LockPending` status is followed by a wait for the
//! unsolicited grant.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::os::unix::net::UnixStream;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{
    OpCode, OpenFlags, Request, RequestEncoder, Response, ResponseDecoder, Status,
};
use crate::storage::{EvictedFile, LockOutcome};
use crate::Error;

pub struct Client {
    encoder: RequestEncoder<BufWriter<UnixStream>>,
    decoder: ResponseDecoder<BufReader<UnixStream>>,
}

impl Client {
    /// Connects the socket. `open_connection` must still be sent before any
    /// other request.
    pub fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        let reader = stream.try_clone()?;
        Ok(Self {
            encoder: RequestEncoder::new(BufWriter::new(stream)),
            decoder: ResponseDecoder::new(BufReader::new(reader)),
        })
    }

    /// Bounds how long any read waits for the server. `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.decoder.get_ref().get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn open_connection(&mut self) -> Result<()> {
        self.call(Request::new(OpCode::OpenConnection, ""))?;
        Ok(())
    }

    pub fn close_connection(&mut self) -> Result<()> {
        self.call(Request::new(OpCode::CloseConnection, ""))?;
        Ok(())
    }

    /// Opens `path`, creating it with `CREATE`. With `LOCK` this blocks until
    /// the lock is held. Returns files evicted to make room.
    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<Vec<EvictedFile>> {
        let (evicted, response) = self.exchange(Request::open_file(path, flags))?;
        match response.status {
            Status::Success => Ok(evicted),
            Status::LockPending => {
                self.wait_for_lock(path)?;
                Ok(evicted)
            }
            status => Err(server_error(status, response.path)),
        }
    }

    pub fn close_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::new(OpCode::CloseFile, path))?;
        Ok(())
    }

    /// Writes a file created and locked by this client. Returns files
    /// evicted to make room.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<Vec<EvictedFile>> {
        let request = Request::new(OpCode::WriteFile, path).with_body(data.to_vec());
        let (evicted, response) = self.exchange(request)?;
        check(response)?;
        Ok(evicted)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(self.call(Request::new(OpCode::ReadFile, path))?.body)
    }

    /// Reads up to `n` files, every readable file when `n <= 0`.
    pub fn read_n_files(&mut self, n: i64) -> Result<Vec<(String, Vec<u8>)>> {
        self.encoder.encode(&Request::read_n_files(n))?;

        let mut files = Vec::new();
        loop {
            let response = check(self.decoder.decode()?)?;
            if response.path.is_empty() {
                return Ok(files);
            }
            files.push((response.path, response.body));
        }
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::new(OpCode::RemoveFile, path))?;
        Ok(())
    }

    /// Blocks until the lock on `path` is held.
    pub fn lock_file(&mut self, path: &str) -> Result<()> {
        if self.try_lock_file(path)? == LockOutcome::Queued {
            self.wait_for_lock(path)?;
        }
        Ok(())
    }

    /// Asks for the lock without waiting. After `Queued` the grant arrives
    /// later and must be collected with [`Client::wait_for_lock`] before the
    /// next request.
    pub fn try_lock_file(&mut self, path: &str) -> Result<LockOutcome> {
        let (_, response) = self.exchange(Request::new(OpCode::LockFile, path))?;
        match response.status {
            Status::Success => Ok(LockOutcome::Acquired),
            Status::LockPending => Ok(LockOutcome::Queued),
            status => Err(server_error(status, response.path)),
        }
    }

    /// Waits for the unsolicited grant of a queued lock. Fails with
    /// `NotFound` if the file was evicted or removed meanwhile.
    pub fn wait_for_lock(&mut self, path: &str) -> Result<()> {
        let response = check(self.decoder.decode()?)?;
        if response.path != path {
            return Err(Error::InvalidState(format!(
                "expected grant for {}, got {}",
                path, response.path
            )));
        }
        Ok(())
    }

    pub fn unlock_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::new(OpCode::UnlockFile, path))?;
        Ok(())
    }

    /// Sends a request and expects a successful final status.
    fn call(&mut self, request: Request) -> Result<Response> {
        let (_, response) = self.exchange(request)?;
        check(response)
    }

    /// Sends a request and reads up to its final status, collecting expelled
    /// files on the way.
    fn exchange(&mut self, request: Request) -> Result<(Vec<EvictedFile>, Response)> {
        self.encoder.encode(&request)?;

        let mut evicted = Vec::new();
        loop {
            let response = self.decoder.decode()?;
            if response.status != Status::FilesExpelled {
                return Ok((evicted, response));
            }
            evicted.push(EvictedFile {
                path: response.path,
                data: response.body,
            });
        }
    }
}

fn check(response: Response) -> Result<Response> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(server_error(response.status, response.path))
    }
}

fn server_error(status: Status, path: String) -> Error {
    Error::Server { status, path }
}

/// Writes `data` to `path` under `dir`, creating parent directories. Leading
/// `/` and `..` components of `path` are dropped so the file stays inside
/// `dir`.
pub fn save_file(dir: &Path, path: &str, data: &[u8]) -> Result<PathBuf> {
    let relative: PathBuf = Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if relative.as_os_str().is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let target = dir.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, data)?;
    Ok(target)
}
