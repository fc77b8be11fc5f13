//! The per-message response capability handed to handlers.
//!
//! Each dispatch cycle owns one [`ResponseSlot`]. Whoever claims it first
//! (the handler through its [`ResponseWriter`], or the connection after a
//! handler panic) writes the only envelope of that cycle; every later claim
//! is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::envelope::{Envelope, HANDLER_FAULT_MSG, NO_RESPONSE_MSG};
use crate::fault::FaultHook;

/// Outbound side of a connection's writer task.
pub(crate) type Outbound = UnboundedSender<Envelope>;

struct SlotInner {
    responded: AtomicBool,
    outbound: Outbound,
}

/// Once-only response slot for one dispatch cycle.
#[derive(Clone)]
pub(crate) struct ResponseSlot(Arc<SlotInner>);

impl ResponseSlot {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self(Arc::new(SlotInner {
            responded: AtomicBool::new(false),
            outbound,
        }))
    }

    /// Queue `envelope` unless this cycle already responded.
    ///
    /// Returns `true` if this call claimed the slot.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        if self.0.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.0.outbound.send(envelope).is_err() {
            debug!("connection closed before the response could be written");
        }
        true
    }

    pub(crate) fn is_responded(&self) -> bool {
        self.0.responded.load(Ordering::Acquire)
    }
}

/// Sends the response for one message.
///
/// `success` and `error` consume the writer, so a handler can respond at
/// most once. Move the writer into a task to respond asynchronously. A
/// writer dropped without responding answers the client with an error
/// envelope.
pub struct ResponseWriter {
    slot: ResponseSlot,
    message_type: String,
    fault_hook: FaultHook,
}

impl ResponseWriter {
    pub(crate) fn new(slot: ResponseSlot, message_type: String, fault_hook: FaultHook) -> Self {
        Self {
            slot,
            message_type,
            fault_hook,
        }
    }

    /// Type of the message being answered.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub(crate) fn fault_hook(&self) -> &FaultHook {
        &self.fault_hook
    }

    pub(crate) fn slot(&self) -> &ResponseSlot {
        &self.slot
    }

    /// Respond with `{status: "success", data}`.
    pub fn success<T: Serialize>(self, data: T) {
        match serde_json::to_value(data) {
            Ok(data) => self.respond(Envelope::success(data)),
            Err(e) => {
                warn!(message_type = %self.message_type, error = %e, "Failed to serialize response data");
                self.respond(Envelope::error(
                    "response data could not be serialized",
                    Some(e.to_string()),
                ))
            }
        }
    }

    /// Respond with `{status: "error", e: {msg, details}}`.
    pub fn error(self, msg: impl fmt::Display, details: Option<String>) {
        self.respond(Envelope::error(msg.to_string(), details))
    }

    fn respond(self, envelope: Envelope) {
        self.slot.send(envelope);
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if self.slot.is_responded() {
            return;
        }
        let msg = if std::thread::panicking() {
            HANDLER_FAULT_MSG
        } else {
            NO_RESPONSE_MSG
        };
        if self.slot.send(Envelope::error(msg, None)) {
            warn!(message_type = %self.message_type, "Handler released its response writer without responding");
        }
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("message_type", &self.message_type)
            .field("responded", &self.slot.is_responded())
            .finish()
    }
}
