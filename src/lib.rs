//! socket-router: a request/response message router over TCP.
//!
//! Clients send length-framed JSON messages tagged with a `type`; the router
//! dispatches each to the handler registered for that type and writes back
//! one response envelope per message.
//!
//! Features:
//! - Persistent connections, any number of messages per socket
//! - Sync handlers, plus async handlers via `register_async`
//! - Exactly one response per message, even when a handler panics
//! - Force-listen: evict the process holding a busy port
//!
//! ## Example
//!
//! ```ignore
//! use socket_router::Router;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.register("echo", |body, res| match body.as_str() {
//!         Some(text) => res.success(text.to_uppercase()),
//!         None => res.error("echo expects a string", None),
//!     })?;
//!     router.listen(4444, false).await?;
//!     tokio::signal::ctrl_c().await?;
//!     router.end().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod fault;
pub mod reclaim;
pub mod registry;
pub mod response;
pub mod router;

pub use client::{Client, ClientError};
pub use connection::Connection;
pub use envelope::{Envelope, ErrorBody, Message};
pub use error::RouterError;
pub use fault::{FaultHook, HandlerFault};
pub use registry::{HandlerRegistry, SharedRegistry};
pub use response::ResponseWriter;
pub use router::Router;
