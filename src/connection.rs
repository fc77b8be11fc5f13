//! Connection state machine for one accepted socket.
//!
//! A connection starts `Idle` holding its stream. `register_dispatcher`
//! splits the stream into a reader task that runs the dispatch cycle per
//! frame and a writer task that drains the response channel. `destroy`
//! aborts both and closes the socket.
//!
//! ```text
//! Idle ──register_dispatcher──► Dispatching ──destroy / peer close──► Closed
//! ```
//!
//! Responses are written in completion order, not arrival order: an async
//! handler that finishes late is answered after faster ones.

use std::collections::HashSet;
use std::mem;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::codec::{self, CodecError, Frame, FrameReader, DEFAULT_MAX_FRAME_SIZE};
use crate::envelope::{
    Envelope, Message, HANDLER_FAULT_MSG, INVALID_FRAME_MSG, INVALID_PAYLOAD_MSG,
};
use crate::error::{Result, RouterError};
use crate::fault::{FaultHook, HandlerFault};
use crate::registry::SharedRegistry;
use crate::response::{Outbound, ResponseSlot, ResponseWriter};

/// Runs the validate → route → invoke → respond cycle.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    registry: SharedRegistry,
    outbound: Outbound,
    fault_hook: FaultHook,
}

impl Dispatcher {
    /// Answer a cycle that never reaches a handler.
    fn reply(&self, envelope: Envelope) {
        ResponseSlot::new(self.outbound.clone()).send(envelope);
    }

    pub(crate) fn process_message(&self, value: Value) {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Rejected message");
                self.reply(Envelope::error(e.to_string(), None));
                return;
            }
        };

        let Some(handler) = self.registry.lookup(&message.message_type) else {
            debug!(message_type = %message.message_type, "No handler for message type");
            self.reply(Envelope::route_not_found(&message.message_type));
            return;
        };

        trace!(message_type = %message.message_type, "Dispatching message");

        let slot = ResponseSlot::new(self.outbound.clone());
        let writer = ResponseWriter::new(
            slot.clone(),
            message.message_type.clone(),
            self.fault_hook.clone(),
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(message.body, writer)));

        if let Err(payload) = result {
            let fault = HandlerFault::from_panic(message.message_type, &*payload);
            // No-op when the handler answered before panicking
            slot.send(Envelope::error(HANDLER_FAULT_MSG, None));
            error!(message_type = %fault.message_type(), panic = %fault.panic_message(), "Handler panicked");
            self.fault_hook.report(&fault);
        }
    }
}

enum State<S> {
    Idle(S),
    Dispatching {
        dispatcher: Dispatcher,
        reader: JoinHandle<()>,
        writer: JoinHandle<()>,
    },
    Closed,
}

/// One client connection bound to a handler registry.
pub struct Connection<S> {
    state: State<S>,
    peer: Option<SocketAddr>,
    max_frame_size: usize,
    fault_hook: FaultHook,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a stream. Nothing is read until `register_dispatcher`.
    pub fn new(stream: S) -> Self {
        Self {
            state: State::Idle(stream),
            peer: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            fault_hook: FaultHook::default(),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_fault_hook(mut self, fault_hook: FaultHook) -> Self {
        self.fault_hook = fault_hook;
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the reader and writer tasks are running.
    pub fn is_dispatching(&self) -> bool {
        matches!(self.state, State::Dispatching { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Start reading frames and dispatching them through `registry`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_dispatcher(&mut self, registry: Option<SharedRegistry>) -> Result<()> {
        let registry = registry.ok_or(RouterError::InvalidRegistry)?;

        let stream = match mem::replace(&mut self.state, State::Closed) {
            State::Idle(stream) => stream,
            dispatching @ State::Dispatching { .. } => {
                self.state = dispatching;
                return Err(RouterError::SocketInUse);
            }
            State::Closed => return Err(RouterError::ConnectionClosed),
        };

        let (read_half, write_half) = io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            registry,
            outbound: tx,
            fault_hook: self.fault_hook.clone(),
        };

        let frames = FrameReader::with_max_frame_size(read_half, self.max_frame_size);
        let reader = tokio::spawn(read_loop(frames, dispatcher.clone(), self.peer));
        let writer = tokio::spawn(write_loop(write_half, rx));

        self.state = State::Dispatching {
            dispatcher,
            reader,
            writer,
        };
        Ok(())
    }

    /// Run one dispatch cycle for an already-decoded frame.
    pub fn process_message(&self, message: Value) -> Result<()> {
        match &self.state {
            State::Dispatching { dispatcher, .. } => {
                dispatcher.process_message(message);
                Ok(())
            }
            State::Idle(_) => Err(RouterError::NotDispatching),
            State::Closed => Err(RouterError::ConnectionClosed),
        }
    }

    /// Wait until the peer closes and every pending response is flushed.
    pub async fn closed(&mut self) {
        if let State::Dispatching { reader, .. } = &mut self.state {
            if let Err(e) = reader.await {
                if e.is_panic() {
                    error!(peer = ?self.peer, "Connection reader panicked");
                }
            }
        }

        // The writer drains until the last sender is gone: ours, then those
        // held by in-flight handlers.
        if let State::Dispatching {
            dispatcher, writer, ..
        } = mem::replace(&mut self.state, State::Closed)
        {
            drop(dispatcher);
            let _ = writer.await;
        }
    }

    /// Close the socket. Calling it again does nothing.
    pub fn destroy(&mut self) {
        match mem::replace(&mut self.state, State::Closed) {
            State::Dispatching { reader, writer, .. } => {
                reader.abort();
                writer.abort();
                debug!(peer = ?self.peer, "Connection destroyed");
            }
            State::Idle(stream) => drop(stream),
            State::Closed => {}
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let State::Dispatching { reader, writer, .. } = &self.state {
            reader.abort();
            writer.abort();
        }
    }
}

async fn read_loop<R>(mut frames: FrameReader<R>, dispatcher: Dispatcher, peer: Option<SocketAddr>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.next_frame().await {
            Ok(Some(Frame::Message(value))) => dispatcher.process_message(value),
            Ok(Some(Frame::Malformed(e))) => {
                warn!(peer = ?peer, error = %e, "Malformed message payload");
                dispatcher.reply(Envelope::error(INVALID_PAYLOAD_MSG, Some(e.to_string())));
            }
            Ok(None) => {
                trace!(peer = ?peer, "Connection closed by client");
                return;
            }
            Err(CodecError::Io(e)) => {
                debug!(peer = ?peer, error = %e, "Connection error");
                return;
            }
            Err(e) => {
                warn!(peer = ?peer, error = %e, "Unrecoverable framing error, closing connection");
                dispatcher.reply(Envelope::error(INVALID_FRAME_MSG, Some(e.to_string())));
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: UnboundedReceiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "Failed to write response");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Sockets currently wrapped by a connection.
///
/// An accepted TCP socket is identified by its local and peer addresses, so
/// a second claim for a live pair means the socket would be wrapped twice.
/// Claims from an earlier `listen` stay live across `end`.
#[derive(Clone, Default, Debug)]
pub(crate) struct SocketClaims(Arc<Mutex<HashSet<SocketKey>>>);

type SocketKey = (SocketAddr, SocketAddr);

impl SocketClaims {
    /// Claim the socket between `local` and `peer`; `None` if it is already
    /// wrapped.
    pub(crate) fn claim(&self, local: SocketAddr, peer: SocketAddr) -> Option<SocketClaim> {
        let key = (local, peer);
        let inserted = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        inserted.then(|| SocketClaim {
            claims: self.clone(),
            key,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases its socket when dropped.
#[derive(Debug)]
pub(crate) struct SocketClaim {
    claims: SocketClaims,
    key: SocketKey,
}

impl Drop for SocketClaim {
    fn drop(&mut self) {
        self.claims
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
