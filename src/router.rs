//! TCP router: owns the listening socket and the handler registry.
//!
//! `listen` binds the port and spawns an accept loop. Every accepted socket
//! becomes a [`Connection`] bound to the shared registry and runs in its own
//! task. `end` stops the accept loop and releases the port; connections that
//! were already accepted keep running until their peer disconnects.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::connection::{Connection, SocketClaims};
use crate::error::{Result, RouterError};
use crate::fault::{FaultHook, HandlerFault};
use crate::reclaim::{self, PortReclaimer, SystemReclaimer};
use crate::registry::{HandlerRegistry, SharedRegistry};
use crate::response::ResponseWriter;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(10);

/// Parse a textual port. Rejects non-numeric, zero, and out-of-range input.
pub fn parse_port(raw: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(RouterError::InvalidPort(raw.to_string())),
    }
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Message router.
pub struct Router {
    registry: SharedRegistry,
    config: RouterConfig,
    reclaimer: Arc<dyn PortReclaimer>,
    fault_hook: FaultHook,
    claims: SocketClaims,
    listening: Option<Listening>,
}

impl Router {
    /// Create a router with default settings.
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            registry: SharedRegistry::new(),
            config,
            reclaimer: Arc::new(SystemReclaimer),
            fault_hook: FaultHook::default(),
            claims: SocketClaims::default(),
            listening: None,
        }
    }

    /// Replace the OS operations used by force-listen.
    pub fn with_reclaimer<R: PortReclaimer + 'static>(mut self, reclaimer: R) -> Self {
        self.reclaimer = Arc::new(reclaimer);
        self
    }

    /// Observe handler faults. Applies to connections accepted after the
    /// next `listen`.
    pub fn with_fault_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandlerFault) + Send + Sync + 'static,
    {
        self.fault_hook = FaultHook::new(hook);
        self
    }

    /// Register a handler. Also visible to connections that are already open.
    pub fn register<F>(&self, message_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) + Send + Sync + 'static,
    {
        self.registry.register(message_type, handler)
    }

    /// Register a handler that responds from a spawned future.
    pub fn register_async<F, Fut>(&self, message_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.register_async(message_type, handler)
    }

    /// Copy of the registered handlers.
    pub fn handlers(&self) -> HandlerRegistry {
        self.registry.snapshot()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.is_some()
    }

    /// Address of the active listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    /// Number of connections currently open.
    pub fn connection_count(&self) -> usize {
        self.claims.len()
    }

    /// Start accepting connections on `port`.
    ///
    /// Resolves once the port is bound. With `force`, an occupied port is
    /// reclaimed by asking its owner to terminate, then bound once more.
    pub async fn listen(&mut self, port: u16, force: bool) -> Result<()> {
        if port == 0 {
            return Err(RouterError::InvalidPort(port.to_string()));
        }

        if let Some(listening) = &self.listening {
            debug!(address = %listening.local_addr, "Already listening");
            return Ok(());
        }

        let addr = SocketAddr::new(self.config.host, port);
        let listener = match bind(addr) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && force => {
                warn!(port, "Port in use, attempting to free it");
                reclaim::free_port(self.reclaimer.as_ref(), port, self.config.port_free_timeout)
                    .await
                    .map_err(|source| RouterError::PortFreeFailed { port, source })?;
                bind(addr).map_err(|e| bind_error(port, e))?
            }
            Err(e) => return Err(bind_error(port, e)),
        };

        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let acceptor = Acceptor {
            registry: self.registry.clone(),
            fault_hook: self.fault_hook.clone(),
            claims: self.claims.clone(),
            max_frame_size: self.config.max_frame_size,
        };
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, shutdown_rx));

        info!(address = %local_addr, "Router listening");
        self.listening = Some(Listening {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    /// Stop accepting connections and release the port.
    pub async fn end(&mut self) -> Result<()> {
        let listening = self.listening.take().ok_or(RouterError::NotRunning)?;

        let _ = listening.shutdown.send(());
        if let Err(e) = listening.accept_task.await {
            if e.is_panic() {
                error!(address = %listening.local_addr, "Accept loop panicked");
            }
        }

        info!(address = %listening.local_addr, "Router stopped");
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind a listener without SO_REUSEPORT, so a busy port fails with
/// `AddrInUse`.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn bind_error(port: u16, e: io::Error) -> RouterError {
    if e.kind() == io::ErrorKind::AddrInUse {
        RouterError::AddressInUse { port, source: e }
    } else {
        RouterError::Io(e)
    }
}

/// State shared by every connection spawned from one listener.
struct Acceptor {
    registry: SharedRegistry,
    fault_hook: FaultHook,
    claims: SocketClaims,
    max_frame_size: usize,
}

impl Acceptor {
    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Accepted socket has no local address");
                return;
            }
        };
        let Some(claim) = self.claims.claim(local, peer) else {
            warn!(peer = %peer, "Socket already wrapped by a connection, rejecting");
            return;
        };

        debug!(peer = %peer, "New connection");

        let registry = self.registry.clone();
        let mut connection = Connection::new(stream)
            .with_peer(peer)
            .with_max_frame_size(self.max_frame_size)
            .with_fault_hook(self.fault_hook.clone());

        tokio::spawn(async move {
            let _claim = claim;
            if let Err(e) = connection.register_dispatcher(Some(registry)) {
                warn!(peer = %peer, error = %e, "Failed to start dispatcher");
                return;
            }
            connection.closed().await;
            debug!(peer = %peer, "Connection closed");
        });
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Acceptor, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            // A dropped sender (router dropped) also stops the loop
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => acceptor.spawn_connection(stream, peer),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::codec::{Frame, FrameReader};
    use crate::envelope::{Envelope, INVALID_FRAME_MSG};
    use crate::reclaim::ReclaimError;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;

    /// Reclaimer whose lookup fails or never finishes.
    enum BrokenReclaimer {
        LookupFails,
        Hangs,
    }

    #[async_trait]
    impl PortReclaimer for BrokenReclaimer {
        async fn find_listener(&self, _port: u16) -> std::result::Result<Option<u32>, ReclaimError> {
            match self {
                BrokenReclaimer::LookupFails => Err(ReclaimError::Lookup(io::Error::new(
                    io::ErrorKind::NotFound,
                    "lsof not found",
                ))),
                BrokenReclaimer::Hangs => std::future::pending().await,
            }
        }

        async fn terminate(&self, _pid: u32) -> std::result::Result<(), ReclaimError> {
            Ok(())
        }
    }

    fn local_config() -> RouterConfig {
        RouterConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..RouterConfig::default()
        }
    }

    fn noop(_: Value, _: ResponseWriter) {}

    async fn next_frame(frames: &mut FrameReader<TcpStream>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), frames.next_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("4444").unwrap(), 4444);
        assert_eq!(parse_port(" 80 ").unwrap(), 80);
        for bad in ["bad_port", "", "0", "-1", "65536"] {
            assert!(matches!(parse_port(bad), Err(RouterError::InvalidPort(_))), "{bad}");
        }
    }

    #[test]
    fn test_register_handler() {
        let router = Router::new();
        router.register("my-handler", noop).unwrap();

        let handlers = router.handlers();
        assert_eq!(handlers.len(), 1);
        assert!(handlers.lookup("my-handler").is_some());
    }

    #[test]
    fn test_register_duplicate() {
        let router = Router::new();
        router.register("my-handler", noop).unwrap();

        let err = router.register("my-handler", noop).unwrap_err();
        assert_eq!(err.to_string(), "my-handler task already registered");
        assert_eq!(router.handlers().len(), 1);
    }

    #[tokio::test]
    async fn test_listen_rejects_port_zero() {
        let mut router = Router::new();
        assert!(matches!(
            router.listen(0, false).await,
            Err(RouterError::InvalidPort(_))
        ));
        assert!(!router.is_listening());
    }

    #[tokio::test]
    async fn test_end_without_listener() {
        let mut router = Router::new();
        assert!(matches!(router.end().await, Err(RouterError::NotRunning)));
        assert!(matches!(router.end().await, Err(RouterError::NotRunning)));
    }

    #[tokio::test]
    async fn test_listen_on_right_port() {
        let mut router = Router::with_config(local_config());
        router.listen(47311, false).await.unwrap();

        assert!(router.is_listening());
        assert_eq!(router.local_addr().unwrap().port(), 47311);

        router.end().await.unwrap();
        assert!(!router.is_listening());
        assert!(router.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let mut router = Router::with_config(local_config());
        router.listen(47312, false).await.unwrap();
        router.listen(47312, false).await.unwrap();
        router.end().await.unwrap();
        assert!(matches!(router.end().await, Err(RouterError::NotRunning)));
    }

    #[tokio::test]
    async fn test_end_allows_rebinding() {
        let mut router = Router::with_config(local_config());
        router.listen(47313, false).await.unwrap();
        router.end().await.unwrap();

        let mut router2 = Router::with_config(local_config());
        router2.listen(47313, false).await.unwrap();
        router2.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_after_listen() {
        let mut router = Router::with_config(local_config());
        router.listen(47314, false).await.unwrap();
        router
            .register("late", |body, res| res.success(body))
            .unwrap();

        let mut client = Client::connect(("127.0.0.1", 47314)).await.unwrap();
        assert_eq!(client.query("late", "value").await.unwrap(), "value");

        router.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_keeps_open_connections() {
        let mut router = Router::with_config(local_config());
        router.register("ping", |_, res| res.success("pong")).unwrap();
        router.listen(47315, false).await.unwrap();

        let mut client = Client::connect(("127.0.0.1", 47315)).await.unwrap();
        assert_eq!(client.query("ping", Value::Null).await.unwrap(), "pong");

        router.end().await.unwrap();
        assert_eq!(client.query("ping", Value::Null).await.unwrap(), "pong");
        assert!(TcpStream::connect(("127.0.0.1", 47315)).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_count() {
        let mut router = Router::with_config(local_config());
        router.register("ping", |_, res| res.success("pong")).unwrap();
        router.listen(47316, false).await.unwrap();

        let mut client = Client::connect(("127.0.0.1", 47316)).await.unwrap();
        client.query("ping", Value::Null).await.unwrap();
        assert_eq!(router.connection_count(), 1);

        drop(client);
        for _ in 0..100 {
            if router.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(router.connection_count(), 0);

        router.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_listen_lookup_failure() {
        let _occupant = std::net::TcpListener::bind(("127.0.0.1", 47317)).unwrap();

        let mut router = Router::with_config(local_config()).with_reclaimer(BrokenReclaimer::LookupFails);
        match router.listen(47317, true).await {
            Err(RouterError::PortFreeFailed { port, source }) => {
                assert_eq!(port, 47317);
                assert!(matches!(source, ReclaimError::Lookup(_)));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!router.is_listening());
    }

    #[tokio::test]
    async fn test_force_listen_times_out() {
        let _occupant = std::net::TcpListener::bind(("127.0.0.1", 47318)).unwrap();

        let config = RouterConfig {
            port_free_timeout: Duration::from_millis(50),
            ..local_config()
        };
        let mut router = Router::with_config(config).with_reclaimer(BrokenReclaimer::Hangs);
        let outcome = tokio::time::timeout(Duration::from_secs(5), router.listen(47318, true))
            .await
            .expect("force-listen ignored its timeout");
        match outcome {
            Err(RouterError::PortFreeFailed { port, source }) => {
                assert_eq!(port, 47318);
                assert!(matches!(source, ReclaimError::Timeout(_)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_framing_closes_tcp_connection() {
        let mut router = Router::with_config(local_config());
        router.listen(47319, false).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", 47319)).await.unwrap();
        stream.write_all(b"hello#").await.unwrap();

        let mut frames = FrameReader::new(stream);
        match next_frame(&mut frames).await {
            Some(Frame::Message(value)) => {
                let envelope: Envelope = serde_json::from_value(value).unwrap();
                match envelope {
                    Envelope::Error { e } => assert_eq!(e.msg, INVALID_FRAME_MSG),
                    other => panic!("unexpected: {:?}", other),
                }
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(next_frame(&mut frames).await.is_none());

        for _ in 0..100 {
            if router.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(router.connection_count(), 0);

        router.end().await.unwrap();
    }
}
