//! Listening endpoint construction and teardown
//!
//! Every endpoint gets the same fixed option set before bind:
//! - SO_REUSEADDR and SO_REUSEPORT (many sockets, one port)
//! - TCP_NODELAY on, TCP_CORK off
//! - 1 MiB SO_RCVBUF and SO_SNDBUF
//!
//! The socket is owned by a `socket2::Socket` until it is listening, so any
//! failure along the way releases the descriptor before the error surfaces.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::ErrorKind;

/// Socket buffer size applied to both directions
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Errors while opening an endpoint
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("socket creation failed: {source}")]
    SocketCreateFailed {
        #[source]
        source: io::Error,
    },
    #[error("setting {option} failed: {source}")]
    OptionFailed {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("bind to port {port} failed: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("listen with backlog {backlog} failed: {source}")]
    ListenFailed {
        backlog: u16,
        #[source]
        source: io::Error,
    },
}

impl EndpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EndpointError::SocketCreateFailed { .. } => ErrorKind::SocketCreateFailed,
            EndpointError::OptionFailed { .. } => ErrorKind::OptionFailed,
            EndpointError::BindFailed { .. } => ErrorKind::BindFailed,
            EndpointError::ListenFailed { .. } => ErrorKind::ListenFailed,
        }
    }
}

/// Options applied to every listening socket before bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub nodelay: bool,
    pub cork: bool,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            reuse_port: true,
            nodelay: true,
            cork: false,
            recv_buffer_size: SOCKET_BUFFER_SIZE,
            send_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl SocketOptions {
    /// Apply every option, stopping at the first failure
    fn apply(&self, socket: &Socket) -> Result<(), EndpointError> {
        socket
            .set_reuse_address(self.reuse_address)
            .map_err(option_failed("SO_REUSEADDR"))?;

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(self.reuse_port)
            .map_err(option_failed("SO_REUSEPORT"))?;

        socket
            .set_nodelay(self.nodelay)
            .map_err(option_failed("TCP_NODELAY"))?;

        #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
        socket
            .set_cork(self.cork)
            .map_err(option_failed("TCP_CORK"))?;

        socket
            .set_recv_buffer_size(self.recv_buffer_size)
            .map_err(option_failed("SO_RCVBUF"))?;
        socket
            .set_send_buffer_size(self.send_buffer_size)
            .map_err(option_failed("SO_SNDBUF"))?;

        Ok(())
    }
}

fn option_failed(option: &'static str) -> impl FnOnce(io::Error) -> EndpointError {
    move |source| EndpointError::OptionFailed { option, source }
}

/// Creates the listening endpoint for a worker slot
///
/// The supervisor opens endpoints strictly in slot order through this trait.
pub trait EndpointFactory: Send + Sync {
    fn open(&self, index: usize, port: u16, backlog: u16) -> Result<Endpoint, EndpointError>;
}

/// Opens real TCP sockets on the wildcard IPv4 address
#[derive(Debug, Clone, Default)]
pub struct SocketEndpointFactory {
    options: SocketOptions,
}

impl SocketEndpointFactory {
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }
}

impl EndpointFactory for SocketEndpointFactory {
    fn open(&self, index: usize, port: u16, backlog: u16) -> Result<Endpoint, EndpointError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| EndpointError::SocketCreateFailed { source })?;

        self.options.apply(&socket)?;
        socket
            .set_nonblocking(true)
            .map_err(option_failed("O_NONBLOCK"))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket
            .bind(&addr.into())
            .map_err(|source| EndpointError::BindFailed { port, source })?;

        socket
            .listen(i32::from(backlog))
            .map_err(|source| EndpointError::ListenFailed { backlog, source })?;

        let listener = register(socket)
            .map_err(|source| EndpointError::ListenFailed { backlog, source })?;

        let endpoint = Endpoint::from_listener(index, backlog, listener)
            .map_err(|source| EndpointError::ListenFailed { backlog, source })?;

        tracing::debug!(
            endpoint = index,
            addr = %endpoint.local_addr(),
            backlog,
            "endpoint listening"
        );
        Ok(endpoint)
    }
}

/// Hand a listening socket to the tokio reactor of the current runtime
fn register(socket: Socket) -> io::Result<TcpListener> {
    // from_std panics outside a runtime
    tokio::runtime::Handle::try_current().map_err(io::Error::other)?;
    TcpListener::from_std(socket.into())
}

/// One listening socket owned by one worker slot
#[derive(Debug)]
pub struct Endpoint {
    index: usize,
    local_addr: SocketAddr,
    backlog: u16,
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
}

impl Endpoint {
    /// Wrap an already listening socket
    pub fn from_listener(index: usize, backlog: u16, listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            index,
            local_addr,
            backlog,
            listener: Mutex::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn backlog(&self) -> u16 {
        self.backlog
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Borrow the socket for a worker's accept loop
    ///
    /// Returns `None` once the endpoint is closed.
    pub fn borrow(&self) -> Option<EndpointRef> {
        self.listener.lock().as_ref().map(|listener| EndpointRef {
            index: self.index,
            listener: Arc::clone(listener),
            closed: self.closed.clone(),
        })
    }

    /// Shut the socket down in both directions and release it
    ///
    /// Borrowers are woken through their `closed()` future. The descriptor
    /// itself is freed once the last borrower drops its reference.
    /// Closing an already closed endpoint does nothing.
    pub fn close(&self) -> io::Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(());
        };

        let result = match SockRef::from(listener.as_ref()).shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Some platforms refuse shutdown on a socket that never connected
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                tracing::debug!(endpoint = self.index, "shutdown on listener not supported");
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.closed.cancel();
        drop(listener);

        tracing::debug!(endpoint = self.index, "endpoint closed");
        result
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(endpoint = self.index, error = %e, "endpoint shutdown failed on drop");
        }
    }
}

/// A worker's borrowed view of an endpoint
///
/// Can accept connections but cannot close the endpoint.
#[derive(Debug, Clone)]
pub struct EndpointRef {
    index: usize,
    listener: Arc<TcpListener>,
    closed: CancellationToken,
}

impl EndpointRef {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Completes when the owning endpoint is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_ephemeral_port() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();

        assert_eq!(endpoint.index(), 0);
        assert_eq!(endpoint.backlog(), 16);
        assert_ne!(endpoint.local_addr().port(), 0);
        assert!(!endpoint.is_closed());
        assert!(endpoint.borrow().is_some());
    }

    #[tokio::test]
    async fn test_options_applied() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();
        let borrowed = endpoint.borrow().unwrap();
        let sock = SockRef::from(borrowed.listener.as_ref());

        assert!(sock.reuse_address().unwrap());
        assert!(sock.nodelay().unwrap());
        #[cfg(target_os = "linux")]
        {
            assert!(sock.reuse_port().unwrap());
            assert!(!sock.cork().unwrap());
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_endpoints_share_port() {
        let factory = SocketEndpointFactory::default();
        let first = factory.open(0, 0, 16).unwrap();
        let port = first.local_addr().port();

        let second = factory.open(1, port, 16).unwrap();
        assert_eq!(second.local_addr().port(), port);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        // std listeners don't set SO_REUSEPORT, so the port is exclusive
        let holder = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = SocketEndpointFactory::default().open(0, port, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BindFailed);
        assert!(matches!(err, EndpointError::BindFailed { port: p, .. } if p == port));
    }

    #[test]
    fn test_open_outside_runtime_releases_socket() {
        let port = crate::test_utils::free_port();

        // Fails at reactor registration, after bind and listen succeeded
        let err = SocketEndpointFactory::default().open(0, port, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ListenFailed);

        // A leaked listener would still hold the port
        assert!(crate::test_utils::port_is_free(port));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();

        endpoint.close().unwrap();
        assert!(endpoint.is_closed());
        assert!(endpoint.borrow().is_none());

        endpoint.close().unwrap();
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_borrower() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();
        let borrowed = endpoint.borrow().unwrap();

        let waiter = tokio::spawn(async move { borrowed.closed().await });
        endpoint.close().unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("borrower was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();
        let port = endpoint.local_addr().port();

        endpoint.close().unwrap();
        drop(endpoint);

        assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
    }

    #[tokio::test]
    async fn test_accepts_connections() {
        let endpoint = SocketEndpointFactory::default().open(0, 0, 16).unwrap();
        let port = endpoint.local_addr().port();
        let borrowed = endpoint.borrow().unwrap();

        let client = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let (accepted, client) = tokio::join!(borrowed.accept(), client);

        let (_stream, peer) = accepted.unwrap();
        assert_eq!(peer, client.unwrap().local_addr().unwrap());
    }
}
