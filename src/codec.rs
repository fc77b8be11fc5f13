//! Length-prefixed JSON framing.
//!
//! Every frame is the decimal byte length of a JSON document, a `#`
//! delimiter, and the document itself:
//!
//! ```text
//! Frame:   <length>#<json of exactly length bytes>
//!
//! Example: 27#{"type":"echo","body":"hi"}
//! ```
//!
//! The same framing is used in both directions.

use std::io;

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Separator between the length prefix and the payload.
pub const DELIMITER: u8 = b'#';

/// Default upper bound on a single frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest accepted length prefix; `usize::MAX` has 20 digits.
const MAX_PREFIX_DIGITS: usize = 20;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Outbound value could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The length prefix is not a decimal number.
    #[error("invalid frame length prefix")]
    InvalidLength,

    /// The announced payload exceeds the configured limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    /// The stream ended part-way through a frame.
    #[error("connection closed in the middle of a frame")]
    UnexpectedEof,
}

/// Result of scanning a buffer for one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A complete frame is buffered.
    Complete {
        /// Offset of the first payload byte (prefix + delimiter).
        payload_start: usize,
        /// Payload length in bytes.
        payload_len: usize,
    },
    /// Need more data.
    Incomplete,
    /// The prefix is not a decimal length.
    InvalidLength,
    /// The prefix announces a payload over the limit.
    TooLarge(usize),
}

impl ParseResult {
    /// Total bytes a complete frame occupies in the buffer.
    pub fn frame_len(&self) -> Option<usize> {
        match self {
            ParseResult::Complete {
                payload_start,
                payload_len,
            } => Some(payload_start + payload_len),
            _ => None,
        }
    }
}

/// Scan `input` for one frame.
pub fn parse(input: &[u8], max_frame_size: usize) -> ParseResult {
    let delimiter = match input.iter().position(|&b| b == DELIMITER) {
        Some(pos) => pos,
        None => {
            // Reject garbage before waiting for a delimiter that may never come
            if input.len() > MAX_PREFIX_DIGITS || !input.iter().all(u8::is_ascii_digit) {
                return ParseResult::InvalidLength;
            }
            return ParseResult::Incomplete;
        }
    };

    let prefix = &input[..delimiter];
    if prefix.is_empty()
        || prefix.len() > MAX_PREFIX_DIGITS
        || !prefix.iter().all(u8::is_ascii_digit)
    {
        return ParseResult::InvalidLength;
    }

    let length: usize = match std::str::from_utf8(prefix).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };

    if length > max_frame_size {
        return ParseResult::TooLarge(length);
    }

    let payload_start = delimiter + 1;
    if input.len() - payload_start < length {
        return ParseResult::Incomplete;
    }

    ParseResult::Complete {
        payload_start,
        payload_len: length,
    }
}

/// Serialize `value` into a single frame.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<BytesMut, CodecError> {
    let json = serde_json::to_vec(value)?;
    let header = format!("{}#", json.len());

    let mut frame = BytesMut::with_capacity(header.len() + json.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// One decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// The payload parsed as JSON.
    Message(Value),
    /// The frame was well delimited but its payload is not JSON.
    Malformed(serde_json::Error),
}

/// Reads frames off an async byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default frame size limit.
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a reader with a custom frame size limit.
    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            max_frame_size,
        }
    }

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame
    /// boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        loop {
            match parse(&self.buffer, self.max_frame_size) {
                ParseResult::Complete {
                    payload_start,
                    payload_len,
                } => {
                    let frame = self.buffer.split_to(payload_start + payload_len);
                    let payload = &frame[payload_start..];
                    return Ok(Some(match serde_json::from_slice(payload) {
                        Ok(value) => Frame::Message(value),
                        Err(e) => Frame::Malformed(e),
                    }));
                }
                ParseResult::Incomplete => {
                    let n = self.reader.read_buf(&mut self.buffer).await?;
                    if n == 0 {
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        return Err(CodecError::UnexpectedEof);
                    }
                }
                ParseResult::InvalidLength => return Err(CodecError::InvalidLength),
                ParseResult::TooLarge(len) => {
                    return Err(CodecError::TooLarge {
                        len,
                        max: self.max_frame_size,
                    })
                }
            }
        }
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
