//! Newline-delimited JSON framing over a raw byte stream.

use log::trace;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

const READ_CHUNK: usize = 16384;

/// Errors surfaced by [`FramedStream`].
///
/// `Closed` covers both a clean zero-byte read and transport failures such as
/// a broken pipe; the peer going away is an expected condition, not a fault.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

struct ReadState<S> {
    half: ReadHalf<S>,
    buffer: Vec<u8>,
}

struct WriteState<S> {
    half: WriteHalf<S>,
    closed: bool,
}

/// A bidirectional stream of whole JSON objects, one per `\n`-terminated line.
///
/// Reads and writes are independently serialized: at most one logical read and
/// one logical write are in flight at a time, and neither blocks the other.
/// The framing layer has no knowledge of message semantics; it returns raw
/// string-keyed JSON objects and leaves interpretation to the caller.
///
/// Newline framing is safe for JSON because encoded JSON text never contains
/// a raw, unescaped `\n`.
pub struct FramedStream<S> {
    reader: Mutex<ReadState<S>>,
    writer: Mutex<WriteState<S>>,
}

impl<S: AsyncRead + AsyncWrite> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(ReadState {
                half: read_half,
                buffer: Vec::new(),
            }),
            writer: Mutex::new(WriteState {
                half: write_half,
                closed: false,
            }),
        }
    }

    /// Returns the next complete JSON object from the stream.
    ///
    /// Receives chunks into an internal buffer until a delimiter shows up, so
    /// a frame may arrive split across any number of chunks and a single chunk
    /// may carry several frames; the remainder stays buffered for the next
    /// call. A zero-byte read or transport error yields [`FrameError::Closed`];
    /// text that is not valid JSON propagates as [`FrameError::Parse`]; an
    /// empty line or a non-object value is [`FrameError::Invalid`].
    pub async fn read(&self) -> Result<Map<String, Value>, FrameError> {
        let mut state = self.reader.lock().await;
        loop {
            if let Some(delim) = state.buffer.iter().position(|&b| b == b'\n') {
                let line = state.buffer[..delim].to_vec();
                state.buffer.drain(..=delim);
                trace!("frame in: {}", String::from_utf8_lossy(&line));
                return decode_frame(&line);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let received = state
                .half
                .read(&mut chunk)
                .await
                .map_err(|_| FrameError::Closed)?;
            if received == 0 {
                return Err(FrameError::Closed);
            }
            state.buffer.extend_from_slice(&chunk[..received]);
        }
    }

    /// Serializes `message` and writes it as one frame.
    ///
    /// The serialized bytes and the delimiter go out in a single locked write,
    /// so concurrent writers never interleave within a frame.
    pub async fn write<T: Serialize>(&self, message: &T) -> Result<(), FrameError> {
        let encoded = serde_json::to_string(message)?;
        self.write_line(&encoded).await
    }

    /// Writes an already-encoded JSON object as one frame.
    pub(crate) async fn write_line(&self, line: &str) -> Result<(), FrameError> {
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        let mut state = self.writer.lock().await;
        if state.closed {
            return Err(FrameError::Closed);
        }
        trace!("frame out: {}", line);
        state
            .half
            .write_all(&framed)
            .await
            .map_err(|_| FrameError::Closed)?;
        state.half.flush().await.map_err(|_| FrameError::Closed)
    }

    /// Shuts the stream down, waiting for any in-flight read and write to
    /// finish first. Safe to call more than once.
    pub async fn close(&self) {
        let _read = self.reader.lock().await;
        let mut write = self.writer.lock().await;
        if write.closed {
            return;
        }
        write.closed = true;
        let _ = write.half.shutdown().await;
    }
}

fn decode_frame(line: &[u8]) -> Result<Map<String, Value>, FrameError> {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(FrameError::Invalid("empty frame"));
    }
    match serde_json::from_slice::<Value>(line)? {
        Value::Object(record) => Ok(record),
        _ => Err(FrameError::Invalid("frame is not a JSON object")),
    }
}
