//! Per-connection processing boundary
//!
//! Workers only accept and hand off. Everything that happens on an accepted
//! connection belongs to a [`ConnectionHandler`].

use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::infrastructure::pool::PooledBuffer;

/// An accepted connection together with its processing buffer
///
/// Dropping it closes the stream and returns the buffer to the pool, each
/// exactly once.
#[derive(Debug)]
pub struct Connection {
    /// Slot index of the worker that accepted the connection
    pub worker: usize,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    pub buffer: PooledBuffer,
}

/// Processes one accepted connection to completion
///
/// The handler owns the [`Connection`] and must eventually return. A worker
/// being stopped waits for every handler it started.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send;
}

/// Writes back whatever it reads until the peer closes
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        async move {
            let Connection {
                worker,
                peer,
                mut stream,
                mut buffer,
            } = conn;

            loop {
                let n = match stream.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(worker, %peer, error = %e, "read failed");
                        break;
                    }
                };

                if let Err(e) = stream.write_all(&buffer[..n]).await {
                    tracing::debug!(worker, %peer, error = %e, "write failed");
                    break;
                }
            }
        }
    }
}
