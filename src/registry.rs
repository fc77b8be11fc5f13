//! Handler registry mapping message types to handlers.
//!
//! A [`HandlerRegistry`] is a plain map with unique keys. The router and its
//! connections share one through [`SharedRegistry`]: registration takes a
//! short write lock, lookups take a read lock and clone the handler out, so
//! no handler ever runs while the lock is held.
//!
//! # Example
//!
//! ```ignore
//! use socket_router::registry::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("echo", |body, res| res.success(body))?;
//! assert!(registry.contains("echo"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error};

use crate::envelope::{Envelope, HANDLER_FAULT_MSG};
use crate::error::{Result, RouterError};
use crate::fault::HandlerFault;
use crate::response::ResponseWriter;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(Value, ResponseWriter) + Send + Sync + 'static>;

/// Registry mapping message types to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `message_type`.
    ///
    /// Fails with `DuplicateHandler` if the type is taken; the existing
    /// handler is kept.
    pub fn register<F>(&mut self, message_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) + Send + Sync + 'static,
    {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(RouterError::InvalidType);
        }
        if self.handlers.contains_key(&message_type) {
            return Err(RouterError::DuplicateHandler(message_type));
        }

        debug!(message_type = %message_type, "Registered handler");
        self.handlers.insert(message_type, Arc::new(handler));
        Ok(())
    }

    /// Register an async handler.
    ///
    /// Each invocation is spawned onto the current tokio runtime. A panic
    /// inside the future is reported as a handler fault and answered with
    /// the handler-fault envelope, unless the handler responded first.
    pub fn register_async<F, Fut>(
        &mut self,
        message_type: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(message_type, move |body, writer| {
            let message_type = writer.message_type().to_string();
            let hook = writer.fault_hook().clone();
            let slot = writer.slot().clone();
            let mut fut = Box::pin(AssertUnwindSafe(handler(body, writer)).catch_unwind());

            tokio::spawn(async move {
                if let Err(payload) = (&mut fut).await {
                    let fault = HandlerFault::from_panic(message_type, &*payload);
                    error!(message_type = %fault.message_type(), panic = %fault.panic_message(), "Async handler panicked");
                    hook.report(&fault);
                    // The writer is still inside `fut`; claim the slot before it drops
                    slot.send(Envelope::error(HANDLER_FAULT_MSG, None));
                }
                drop(fut);
            });
        })
    }

    /// Get the handler for a message type.
    pub fn lookup(&self, message_type: &str) -> Option<Handler> {
        self.handlers.get(message_type).cloned()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered message types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// A registry shared between a router and its connections.
#[derive(Clone, Default, Debug)]
pub struct SharedRegistry(Arc<RwLock<HandlerRegistry>>);

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, message_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) + Send + Sync + 'static,
    {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(message_type, handler)
    }

    pub fn register_async<F, Fut>(&self, message_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_async(message_type, handler)
    }

    pub fn lookup(&self, message_type: &str) -> Option<Handler> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(message_type)
    }

    /// Copy of the current handler map.
    pub fn snapshot(&self) -> HandlerRegistry {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl From<HandlerRegistry> for SharedRegistry {
    fn from(registry: HandlerRegistry) -> Self {
        Self(Arc::new(RwLock::new(registry)))
    }
}
