//! Minimal client for talking to a router.
//!
//! # Example
//!
//! ```ignore
//! use socket_router::Client;
//!
//! let mut client = Client::connect(("127.0.0.1", 4444)).await?;
//! let data = client.query("echo", "hi").await?;
//! assert_eq!(data, "HI");
//! ```

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::codec::{self, CodecError, Frame, FrameReader};
use crate::envelope::{Envelope, Message};

/// Client-side errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// The router closed the connection.
    #[error("connection closed")]
    Closed,

    /// The router answered with an error envelope.
    #[error("remote error: {msg}")]
    Remote { msg: String, details: Option<String> },
}

/// A persistent connection to a router.
pub struct Client {
    frames: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            frames: FrameReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send a message without waiting for its response.
    pub async fn send<T: Serialize>(&mut self, message_type: &str, body: T) -> Result<(), ClientError> {
        let message = Message::new(message_type, serde_json::to_value(body)?);
        self.send_value(&message).await
    }

    /// Send any JSON value as a frame, valid message or not.
    pub async fn send_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ClientError> {
        let frame = codec::encode(value)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Wait for the next response envelope.
    pub async fn receive(&mut self) -> Result<Envelope, ClientError> {
        match self.frames.next_frame().await? {
            Some(Frame::Message(value)) => Ok(serde_json::from_value(value)?),
            Some(Frame::Malformed(e)) => Err(ClientError::InvalidResponse(e)),
            None => Err(ClientError::Closed),
        }
    }

    /// Send a message and wait for its response data.
    pub async fn query<T: Serialize>(&mut self, message_type: &str, body: T) -> Result<Value, ClientError> {
        self.send(message_type, body).await?;
        match self.receive().await? {
            Envelope::Success { data } => Ok(data),
            Envelope::Error { e } => Err(ClientError::Remote {
                msg: e.msg,
                details: e.details,
            }),
        }
    }
}
