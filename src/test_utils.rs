//! Shared helpers for socket-level tests

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::handler::{Connection, ConnectionHandler};
use crate::net::{Endpoint, EndpointError, EndpointFactory, SocketEndpointFactory, SocketOptions};

/// Connect to the fleet on loopback, send `payload`, expect it echoed back
pub async fn echo_roundtrip(port: u16, payload: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(payload).await?;

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

    if echoed != payload {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "echo mismatch"));
    }
    Ok(())
}

/// A port nobody listens on right now
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

/// True if an exclusive (no SO_REUSEPORT) listener can take the port
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// How [`FaultyFactory`] fails at its chosen slot
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Synthetic bind error, usable at any index
    Bind,
    /// Real bind without SO_REUSEPORT, refused by the kernel because earlier
    /// slots already hold the port
    ExclusiveBind,
    Listen,
    /// Real endpoint, closed before it is handed out, so no worker can
    /// borrow it
    ClosedEndpoint,
}

/// Opens real endpoints, except at one slot index
pub struct FaultyFactory {
    fail_at: usize,
    fault: Fault,
    inner: SocketEndpointFactory,
    pub opened: AtomicUsize,
}

impl FaultyFactory {
    pub fn new(fail_at: usize, fault: Fault) -> Self {
        Self {
            fail_at,
            fault,
            inner: SocketEndpointFactory::default(),
            opened: AtomicUsize::new(0),
        }
    }
}

impl EndpointFactory for FaultyFactory {
    fn open(&self, index: usize, port: u16, backlog: u16) -> Result<Endpoint, EndpointError> {
        if index == self.fail_at {
            return match self.fault {
                Fault::Bind => Err(EndpointError::BindFailed {
                    port,
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                }),
                Fault::ExclusiveBind => SocketEndpointFactory::new(SocketOptions {
                    reuse_port: false,
                    ..SocketOptions::default()
                })
                .open(index, port, backlog),
                Fault::Listen => Err(EndpointError::ListenFailed {
                    backlog,
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                }),
                Fault::ClosedEndpoint => {
                    let endpoint = self.inner.open(index, port, backlog)?;
                    endpoint.close().map_err(|source| EndpointError::ListenFailed { backlog, source })?;
                    Ok(endpoint)
                }
            };
        }

        let endpoint = self.inner.open(index, port, backlog)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(endpoint)
    }
}

/// Holds each connection for a fixed time, reporting start and finish
pub struct GatedHandler {
    hold: Duration,
    started: Notify,
    pub finished: AtomicUsize,
}

impl GatedHandler {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            started: Notify::new(),
            finished: AtomicUsize::new(0),
        }
    }

    pub async fn wait_started(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.started.notified())
            .await
            .expect("handler never started");
    }
}

impl ConnectionHandler for GatedHandler {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        async move {
            self.started.notify_one();
            tokio::time::sleep(self.hold).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
