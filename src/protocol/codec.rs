use byteorder::{ByteOrder, NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, ErrorKind, Read, Write};

use super::{OpCode, Request, Response, Status};
use crate::error::Result;
use crate::Error;

/// Longest path accepted on the wire.
pub const MAX_PATH: usize = 4096;

/// Fixed width of the status phrase field in response frames.
pub const PHRASE_LEN: usize = 64;

// Request encoder
pub struct RequestEncoder<W: Write> {
    writer: W,
}

impl<W: Write> RequestEncoder<W> {
    pub fn new(writer: W) -> Self {
        RequestEncoder { writer }
    }

    pub fn encode(&mut self, request: &Request) -> Result<()> {
        self.writer
            .write_u32::<NativeEndian>(request.op.code())
            .map_err(|e| Error::Encode("op", e))?;

        write_field(&mut self.writer, "path", request.path.as_bytes())?;
        write_field(&mut self.writer, "body", &request.body)?;

        self.writer.flush().map_err(|e| Error::Encode("frame", e))
    }
}

// Request decoder
pub struct RequestDecoder<R: Read> {
    reader: R,
    max_body: u64,
}

impl<R: Read> RequestDecoder<R> {
    pub fn new(reader: R) -> Self {
        RequestDecoder {
            reader,
            max_body: u64::MAX,
        }
    }

    /// Bodies longer than `max_body` are drained and reported as
    /// `Error::BodyTooLarge`, leaving the stream at the next frame.
    pub fn with_max_body(mut self, max_body: u64) -> Self {
        self.max_body = max_body;
        self
    }

    pub fn decode(&mut self) -> Result<Request> {
        let code = read_frame_code(&mut self.reader, "op")?;
        let path = read_path(&mut self.reader)?;

        let body_len = read_len(&mut self.reader, "body_len")?;
        if body_len > self.max_body {
            discard(&mut self.reader, body_len)?;
            return Err(Error::BodyTooLarge(body_len));
        }
        let body = read_bytes(&mut self.reader, "body", body_len)?;

        let op = OpCode::try_from(code)?;
        Ok(Request { op, path, body })
    }
}

// Response encoder
pub struct ResponseEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ResponseEncoder<W> {
    pub fn new(writer: W) -> Self {
        ResponseEncoder { writer }
    }

    pub fn encode(&mut self, response: &Response) -> Result<()> {
        self.write_one(response)?;
        self.writer.flush().map_err(|e| Error::Encode("frame", e))
    }

    /// Writes several responses back to back with a single flush.
    pub fn encode_all<'a>(&mut self, responses: impl IntoIterator<Item = &'a Response>) -> Result<()> {
        for response in responses {
            self.write_one(response)?;
        }
        self.writer.flush().map_err(|e| Error::Encode("frame", e))
    }

    fn write_one(&mut self, response: &Response) -> Result<()> {
        self.writer
            .write_u32::<NativeEndian>(response.status.code())
            .map_err(|e| Error::Encode("status", e))?;

        self.writer
            .write_all(&phrase(response.status))
            .map_err(|e| Error::Encode("phrase", e))?;

        write_field(&mut self.writer, "path", response.path.as_bytes())?;
        write_field(&mut self.writer, "body", &response.body)
    }
}

// Response decoder
pub struct ResponseDecoder<R: Read> {
    reader: R,
}

impl<R: Read> ResponseDecoder<R> {
    pub fn new(reader: R) -> Self {
        ResponseDecoder { reader }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn decode(&mut self) -> Result<Response> {
        let code = read_frame_code(&mut self.reader, "status")?;

        let mut phrase = [0u8; PHRASE_LEN];
        self.reader
            .read_exact(&mut phrase)
            .map_err(|e| field_error("phrase", e))?;

        let path = read_path(&mut self.reader)?;
        let body_len = read_len(&mut self.reader, "body_len")?;
        let body = read_bytes(&mut self.reader, "body", body_len)?;

        let status = Status::try_from(code)?;
        Ok(Response { status, path, body })
    }
}

fn phrase(status: Status) -> [u8; PHRASE_LEN] {
    let mut buf = [0u8; PHRASE_LEN];
    let text = status.message().as_bytes();
    // Keep at least one NUL terminator.
    let len = text.len().min(PHRASE_LEN - 1);
    buf[..len].copy_from_slice(&text[..len]);
    buf
}

fn write_field<W: Write>(writer: &mut W, field: &'static str, bytes: &[u8]) -> Result<()> {
    writer
        .write_u64::<NativeEndian>(bytes.len() as u64)
        .map_err(|e| Error::Encode(field, e))?;
    writer.write_all(bytes).map_err(|e| Error::Encode(field, e))
}

/// Reads the leading code of a frame. A clean EOF before the first byte means
/// the peer closed the connection; anything else short is a broken frame.
fn read_frame_code<R: Read>(reader: &mut R, field: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(Error::PeerClosed),
            Ok(0) => return Err(Error::Malformed(format!("truncated {}", field))),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if filled == 0 && e.kind() == ErrorKind::ConnectionReset => {
                return Err(Error::PeerClosed)
            }
            Err(e) => return Err(Error::Decode(field, e)),
        }
    }

    Ok(NativeEndian::read_u32(&buf))
}

fn read_len<R: Read>(reader: &mut R, field: &'static str) -> Result<u64> {
    reader
        .read_u64::<NativeEndian>()
        .map_err(|e| field_error(field, e))
}

fn read_path<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_len(reader, "path_len")?;
    if len > MAX_PATH as u64 {
        return Err(Error::Malformed(format!(
            "path of {} bytes exceeds {}",
            len, MAX_PATH
        )));
    }

    let bytes = read_bytes(reader, "path", len)?;
    String::from_utf8(bytes).map_err(|_| Error::Malformed("path is not valid UTF-8".to_string()))
}

fn read_bytes<R: Read>(reader: &mut R, field: &'static str, len: u64) -> Result<Vec<u8>> {
    // Grow as data arrives instead of trusting the advertised length up front.
    let mut buf = Vec::new();
    let read = reader
        .take(len)
        .read_to_end(&mut buf)
        .map_err(|e| Error::Decode(field, e))?;

    if (read as u64) < len {
        return Err(Error::Malformed(format!("truncated {}", field)));
    }
    Ok(buf)
}

fn discard<R: Read>(reader: &mut R, len: u64) -> Result<()> {
    let drained = io::copy(&mut reader.take(len), &mut io::sink())
        .map_err(|e| Error::Decode("body", e))?;

    if drained < len {
        return Err(Error::Malformed("truncated body".to_string()));
    }
    Ok(())
}

fn field_error(field: &'static str, err: io::Error) -> Error {
    match err.kind() {
        ErrorKind::UnexpectedEof => Error::Malformed(format!("truncated {}", field)),
        _ => Error::Decode(field, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpenFlags;
    use std::io::Cursor;

    fn encode_request(request: &Request) -> Vec<u8> {
        let mut buf = Vec::new();
        RequestEncoder::new(&mut buf).encode(request).unwrap();
        buf
    }

    fn encode_response(response: &Response) -> Vec<u8> {
        let mut buf = Vec::new();
        ResponseEncoder::new(&mut buf).encode(response).unwrap();
        buf
    }

    #[test]
    fn test_request_encoding_decoding() {
        let request = Request::new(OpCode::WriteFile, "/docs/report.bin")
            .with_body(vec![0x00, 0xFF, 0x10, 0x00, 0x7F]);

        let encoded = encode_request(&request);
        assert_eq!(encoded.len(), 4 + 8 + request.path.len() + 8 + request.body.len());

        let decoded = RequestDecoder::new(encoded.as_slice()).decode().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_encoding_decoding() {
        let response = Response::new(Status::FilesExpelled)
            .with_path("/victim")
            .with_body(b"old contents\0with nul".to_vec());

        let encoded = encode_response(&response);
        assert_eq!(
            encoded.len(),
            4 + PHRASE_LEN + 8 + response.path.len() + 8 + response.body.len()
        );

        // Phrase is NUL padded in place.
        let phrase = &encoded[4..4 + PHRASE_LEN];
        assert!(phrase.starts_with(b"files expelled"));
        assert_eq!(phrase[PHRASE_LEN - 1], 0);

        let decoded = ResponseDecoder::new(encoded.as_slice()).decode().unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_several_frames_on_one_stream() {
        let mut buf = Vec::new();
        let responses = vec![
            Response::new(Status::FilesExpelled).with_path("/a").with_body(b"a".to_vec()),
            Response::success().with_path("/b"),
        ];
        ResponseEncoder::new(&mut buf).encode_all(&responses).unwrap();

        let mut decoder = ResponseDecoder::new(Cursor::new(buf));
        assert_eq!(decoder.decode().unwrap(), responses[0]);
        assert_eq!(decoder.decode().unwrap(), responses[1]);
        assert!(matches!(decoder.decode(), Err(Error::PeerClosed)));
    }

    #[test]
    fn test_peer_closed_versus_truncated() {
        let empty: &[u8] = &[];
        assert!(matches!(
            RequestDecoder::new(empty).decode(),
            Err(Error::PeerClosed)
        ));

        let encoded = encode_request(&Request::open_file("/a", OpenFlags::CREATE));
        for cut in [2, 6, 14, encoded.len() - 1] {
            let result = RequestDecoder::new(&encoded[..cut]).decode();
            assert!(
                matches!(result, Err(Error::Malformed(_))),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[test]
    fn test_path_too_long() {
        let request = Request::new(OpCode::ReadFile, "x".repeat(MAX_PATH + 1));
        let encoded = encode_request(&request);

        let result = RequestDecoder::new(encoded.as_slice()).decode();
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_invalid_utf8_path() {
        let mut buf = Vec::new();
        buf.write_u32::<NativeEndian>(OpCode::ReadFile.code()).unwrap();
        buf.write_u64::<NativeEndian>(2).unwrap();
        buf.extend_from_slice(&[0xC3, 0x28]);
        buf.write_u64::<NativeEndian>(0).unwrap();

        let result = RequestDecoder::new(buf.as_slice()).decode();
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_unknown_opcode_keeps_stream_in_sync() {
        let mut buf = Vec::new();
        buf.write_u32::<NativeEndian>(99).unwrap();
        buf.write_u64::<NativeEndian>(2).unwrap();
        buf.extend_from_slice(b"/a");
        buf.write_u64::<NativeEndian>(3).unwrap();
        buf.extend_from_slice(b"xyz");
        let valid = Request::new(OpCode::CloseFile, "/a");
        buf.extend(encode_request(&valid));

        let mut decoder = RequestDecoder::new(Cursor::new(buf));
        assert!(matches!(decoder.decode(), Err(Error::UnknownOpCode(99))));
        assert_eq!(decoder.decode().unwrap(), valid);
    }

    #[test]
    fn test_body_too_large_is_drained() {
        let big = Request::new(OpCode::WriteFile, "/big").with_body(vec![7u8; 128]);
        let next = Request::new(OpCode::CloseFile, "/big");

        let mut buf = encode_request(&big);
        buf.extend(encode_request(&next));

        let mut decoder = RequestDecoder::new(Cursor::new(buf)).with_max_body(64);
        assert!(matches!(decoder.decode(), Err(Error::BodyTooLarge(128))));
        assert_eq!(decoder.decode().unwrap(), next);
    }

    #[test]
    fn test_unknown_status() {
        let mut encoded = encode_response(&Response::success());
        encoded[..4].copy_from_slice(&77u32.to_ne_bytes());

        let result = ResponseDecoder::new(encoded.as_slice()).decode();
        assert!(matches!(result, Err(Error::UnknownStatus(77))));
    }

    #[test]
    fn test_encoding_error() {
        struct FailingWriter;

        impl Write for FailingWriter {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "write failure"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let result = ResponseEncoder::new(FailingWriter).encode(&Response::success());
        assert!(matches!(result, Err(Error::Encode("status", _))));

        let result =
            RequestEncoder::new(FailingWriter).encode(&Request::new(OpCode::OpenConnection, ""));
        assert!(matches!(result, Err(Error::Encode("op", _))));
    }
}
