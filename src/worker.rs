//! Accept loop bound to a single endpoint
//!
//! A worker waits on three things at once: its stop token, its endpoint
//! closing underneath it, and the next inbound connection. Accepted
//! connections run as tasks in the worker's own `JoinSet`, so stopping a
//! worker also waits for the connections it already handed off.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::handler::{Connection, ConnectionHandler};
use crate::infrastructure::metrics::ServerMetrics;
use crate::infrastructure::pool::BufferPool;
use crate::net::EndpointRef;
use crate::ErrorKind;

/// Pause after an accept failed for lack of descriptors or memory. The pending
/// connection keeps the listener readable, so retrying at once would spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {index} could not be spawned: {source}")]
    SpawnFailed {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker {index}: endpoint closed while accepting")]
    EndpointClosed { index: usize },
    #[error("worker {index}: accept failed: {source}")]
    AcceptFailed {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker {index} panicked")]
    Panicked { index: usize },
    #[error("worker {index} was aborted by the runtime")]
    Aborted { index: usize },
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::SpawnFailed { .. } => ErrorKind::WorkerSpawnFailed,
            _ => ErrorKind::WorkerFailed,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            WorkerError::SpawnFailed { index, .. }
            | WorkerError::EndpointClosed { index }
            | WorkerError::AcceptFailed { index, .. }
            | WorkerError::Panicked { index }
            | WorkerError::Aborted { index } => *index,
        }
    }
}

/// How a worker's accept loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop was requested and every in-flight connection finished
    Stopped,
}

/// Handle to a running worker task
#[derive(Debug)]
pub struct Worker {
    index: usize,
    cancel: CancellationToken,
    handle: JoinHandle<Result<WorkerExit, WorkerError>>,
}

impl Worker {
    /// Start the accept loop on the current tokio runtime
    ///
    /// # Errors
    /// `SpawnFailed` when called outside a runtime.
    pub fn spawn<H: ConnectionHandler>(
        index: usize,
        endpoint: EndpointRef,
        pool: Arc<BufferPool>,
        handler: Arc<H>,
        metrics: Arc<ServerMetrics>,
    ) -> Result<Self, WorkerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| WorkerError::SpawnFailed {
            index,
            source: io::Error::other(e),
        })?;

        let cancel = CancellationToken::new();
        let task = AcceptLoop {
            index,
            endpoint,
            pool,
            handler,
            metrics,
            cancel: cancel.clone(),
        };

        let handle = runtime.spawn(task.run());
        tracing::debug!(worker = index, "worker spawned");

        Ok(Self {
            index,
            cancel,
            handle,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the task has exited, for any reason
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request a stop without waiting for it
    pub fn signal(&self) {
        self.cancel.cancel();
    }

    /// Request a stop and wait until the task has fully exited
    ///
    /// Returns once the accept loop ended and every connection it started has
    /// finished. There is no timeout. A worker that already failed reports
    /// its original error.
    pub async fn stop(self) -> Result<WorkerExit, WorkerError> {
        self.cancel.cancel();

        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(WorkerError::Panicked { index: self.index }),
            Err(_) => Err(WorkerError::Aborted { index: self.index }),
        }
    }
}

struct AcceptLoop<H> {
    index: usize,
    endpoint: EndpointRef,
    pool: Arc<BufferPool>,
    handler: Arc<H>,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
}

impl<H: ConnectionHandler> AcceptLoop<H> {
    async fn run(self) -> Result<WorkerExit, WorkerError> {
        let index = self.index;
        let mut in_flight = JoinSet::new();
        self.metrics.worker_started();

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Ok(WorkerExit::Stopped),

                _ = self.endpoint.closed() => break Err(WorkerError::EndpointClosed { index }),

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(index, joined);
                }

                accepted = self.endpoint.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(&mut in_flight, stream, peer),
                    Err(e) => {
                        if let Some(outcome) = self.on_accept_error(e).await {
                            break outcome;
                        }
                    }
                },
            }
        };

        // No new connections from here; let the accepted ones finish
        if !in_flight.is_empty() {
            tracing::debug!(worker = index, in_flight = in_flight.len(), "draining connections");
        }
        while let Some(joined) = in_flight.join_next().await {
            reap(index, joined);
        }

        self.metrics.worker_exited(outcome.is_err());
        match &outcome {
            Ok(_) => tracing::debug!(worker = index, "worker stopped"),
            Err(e) => tracing::error!(worker = index, error = %e, "worker failed"),
        }
        outcome
    }

    /// `Some` ends the loop with that outcome
    async fn on_accept_error(&self, e: io::Error) -> Option<Result<WorkerExit, WorkerError>> {
        let index = self.index;
        self.metrics.record_accept_error();

        match classify(&e) {
            AcceptFault::Retry => {
                tracing::warn!(worker = index, error = %e, "transient accept error");
                None
            }
            AcceptFault::BackOff => {
                tracing::warn!(
                    worker = index,
                    error = %e,
                    backoff_ms = ACCEPT_BACKOFF.as_millis() as u64,
                    "out of resources, pausing accept"
                );
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => Some(Ok(WorkerExit::Stopped)),
                    _ = self.endpoint.closed() => Some(Err(WorkerError::EndpointClosed { index })),
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => None,
                }
            }
            AcceptFault::Fatal => Some(Err(WorkerError::AcceptFailed { index, source: e })),
        }
    }

    fn dispatch(&self, in_flight: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let buffer = match self.pool.acquire() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.metrics.record_buffer_failure();
                tracing::warn!(worker = self.index, %peer, error = %e, "dropping connection without buffer");
                return;
            }
        };

        let conn = Connection {
            worker: self.index,
            peer,
            stream,
            buffer,
        };
        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);

        in_flight.spawn(async move {
            let _active = metrics.connection_opened();
            handler.handle(conn).await;
        });
    }
}

fn reap(index: usize, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(worker = index, "connection handler panicked");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFault {
    /// Only the pending connection is affected, accept again right away
    Retry,
    /// The process is out of descriptors or memory, wait before accepting
    BackOff,
    /// The listening socket itself is broken
    Fatal,
}

fn classify(e: &io::Error) -> AcceptFault {
    if is_resource_exhaustion(e) {
        return AcceptFault::BackOff;
    }
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => AcceptFault::Retry,
        _ => AcceptFault::Fatal,
    }
}

/// ENFILE / EMFILE / ENOBUFS / ENOMEM: the socket is fine, the process is full
fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        matches!(e.raw_os_error(), Some(23) | Some(24) | Some(105))
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
