//! Inbound messages and outbound response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error message for a cycle whose handler panicked before responding.
pub const HANDLER_FAULT_MSG: &str = "error in response handler";

/// Error message for a cycle whose handler dropped its writer unanswered.
pub const NO_RESPONSE_MSG: &str = "response handler completed without responding";

/// Error message for a frame whose payload is not JSON.
pub const INVALID_PAYLOAD_MSG: &str = "invalid message payload";

/// Error message sent before closing a connection whose framing is broken.
pub const INVALID_FRAME_MSG: &str = "invalid frame";

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque payload handed to the handler.
    #[serde(default)]
    pub body: Value,
}

/// Reasons a frame cannot be treated as a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The frame carried `null`.
    #[error("no message received")]
    Missing,
    /// `type` is absent, empty, or not a string.
    #[error("no message type found in socket message")]
    MissingType,
}

impl Message {
    /// Create a message.
    pub fn new(message_type: impl Into<String>, body: Value) -> Self {
        Self {
            message_type: message_type.into(),
            body,
        }
    }

    /// Validate a decoded frame. A missing `body` becomes `null`.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let mut object = match value {
            Value::Null => return Err(ValidationError::Missing),
            Value::Object(map) => map,
            _ => return Err(ValidationError::MissingType),
        };

        let message_type = match object.remove("type") {
            Some(Value::String(t)) if !t.is_empty() => t,
            _ => return Err(ValidationError::MissingType),
        };

        Ok(Self {
            message_type,
            body: object.remove("body").unwrap_or(Value::Null),
        })
    }
}

/// Error payload of an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub msg: String,
    pub details: Option<String>,
}

/// Every response written back to a client.
///
/// ```text
/// {"status":"success","data":<any>}
/// {"status":"error","e":{"msg":<string>,"details":<string|null>}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success { data: Value },
    Error { e: ErrorBody },
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Envelope::Success { data }
    }

    pub fn error(msg: impl Into<String>, details: Option<String>) -> Self {
        Envelope::Error {
            e: ErrorBody {
                msg: msg.into(),
                details,
            },
        }
    }

    /// Error envelope for a message type nobody handles.
    pub fn route_not_found(message_type: &str) -> Self {
        Self::error(
            format!("no handler found for this message type (message.type = {message_type})"),
            None,
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }
}
