//! Content-Length message framing for JSON-RPC over byte streams.
//!
//! This module implements HTTP-style Content-Length framing as used by the
//! Language Server Protocol. It gives reliable message boundaries over a
//! stream that may deliver bytes in arbitrary chunks.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! Outbound frames always use CRLF. Inbound header parsing is
//! case-insensitive, ignores unknown headers (e.g. `Content-Type`) and
//! accepts both CRLF and bare LF line endings.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Maximum size of a header block before its terminating blank line.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Size of each read from the inbound stream.
const READ_CHUNK_SIZE: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Framing failures.
///
/// Every variant except `Serialize` means the inbound stream can no longer
/// be trusted to be aligned on a message boundary.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Header block ended without a Content-Length header.
    #[error("Missing Content-Length header")]
    MissingContentLength,

    /// Content-Length value is not a decimal byte count.
    #[error("Invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    /// Declared body size is above `MAX_MESSAGE_SIZE`.
    #[error("Message size {size} exceeds maximum {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// No blank line within `MAX_HEADER_SIZE` bytes.
    #[error("Header block exceeds maximum {0} bytes")]
    HeaderTooLarge(usize),

    /// Body is not valid JSON.
    #[error("Invalid message body: {0}")]
    InvalidBody(#[source] serde_json::Error),

    /// Outbound message could not be serialized.
    #[error("Failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Stream ended in the middle of a frame.
    #[error("Stream closed with {buffered} bytes of an incomplete frame")]
    TruncatedFrame { buffered: usize },

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Encoding
// =============================================================================

/// Serialize a message and wrap it in a Content-Length frame.
///
/// The body is compact JSON; the header value is its exact byte length.
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, FramingError> {
    let body = serde_json::to_vec(message).map_err(FramingError::Serialize)?;
    Ok(frame_body(&body))
}

/// Wrap an already-serialized body in a Content-Length frame.
pub fn frame_body(body: &[u8]) -> Vec<u8> {
    let header = format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Write one complete frame and flush.
///
/// Callers sharing a writer must hold exclusive access for the whole call
/// so that frames are never interleaved.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    trace!("Wrote frame of {} bytes", frame.len());
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Incremental frame decoder.
///
/// Bytes are pushed as they arrive; `decode_next` yields complete bodies
/// in order. The output does not depend on how the input was chunked.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Parsed `(header_len, body_len)` of the frame at the buffer head.
    pending: Option<(usize, usize)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete message, if one is fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes past the end
    /// of the decoded frame stay buffered for the next call. A zero-length
    /// body decodes to `Value::Null`.
    pub fn decode_next(&mut self) -> Result<Option<Value>, FramingError> {
        let (header_len, body_len) = match self.pending {
            Some(frame) => frame,
            None => match parse_header_block(&self.buffer)? {
                Some(frame) => {
                    self.pending = Some(frame);
                    frame
                }
                None => return Ok(None),
            },
        };

        let frame_len = header_len + body_len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let body: Vec<u8> = self.buffer.drain(..frame_len).skip(header_len).collect();
        self.pending = None;
        debug!("Decoded frame with {} byte body", body_len);

        if body.is_empty() {
            return Ok(Some(Value::Null));
        }

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(FramingError::InvalidBody)
    }
}

/// Locate the end of the header block and extract Content-Length.
///
/// Returns `(header_len, body_len)` where `header_len` includes the blank
/// separator line, or `None` if the block is not yet complete.
fn parse_header_block(buf: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
    let mut content_length: Option<usize> = None;
    let mut line_start = 0;

    while let Some(offset) = buf[line_start..].iter().position(|&b| b == b'\n') {
        let line_end = line_start + offset;
        let line = &buf[line_start..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line_start = line_end + 1;

        // Empty line signals end of headers
        if line.is_empty() {
            let size = content_length.ok_or(FramingError::MissingContentLength)?;
            return Ok(Some((line_start, size)));
        }

        if let Some(size) = parse_header_line(line)? {
            content_length = Some(size);
        }
    }

    if buf.len() > MAX_HEADER_SIZE {
        return Err(FramingError::HeaderTooLarge(MAX_HEADER_SIZE));
    }

    Ok(None)
}

/// Parse a single header line, returning the Content-Length if it is one.
fn parse_header_line(line: &[u8]) -> Result<Option<usize>, FramingError> {
    let line = String::from_utf8_lossy(line);
    let Some((key, value)) = line.split_once(':') else {
        debug!("Ignoring malformed header line: {:?}", line);
        return Ok(None);
    };

    // Ignore other headers (e.g., Content-Type)
    if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }

    let value = value.trim();
    let size: usize = value
        .parse()
        .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;

    if size > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(Some(size))
}

/// Sequence of decoded messages read from an async byte stream.
///
/// Each call to `next_message` reads only as much as needed to complete
/// the next frame, so decoding is driven by data arrival.
pub struct FramedReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Read the next message body.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between frames.
    ///
    /// # Errors
    ///
    /// - `TruncatedFrame` if the stream ends inside a frame
    /// - any header or body error from `FrameDecoder`
    /// - `Io` if the read itself fails
    pub async fn next_message(&mut self) -> Result<Option<Value>, FramingError> {
        loop {
            if let Some(message) = self.decoder.decode_next()? {
                return Ok(Some(message));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                let buffered = self.decoder.buffered();
                if buffered == 0 {
                    return Ok(None);
                }
                return Err(FramingError::TruncatedFrame { buffered });
            }

            trace!("Read {} bytes from stream", n);
            self.decoder.push(&self.chunk[..n]);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
