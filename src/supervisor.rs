//! Fleet supervisor
//!
//! Owns the buffer pool and the worker slots. Startup walks
//! `Idle -> PoolCreated -> Opening(i).. -> Running` and either reaches
//! `Running` with every slot live or rolls everything back and ends in
//! `Failed`. Shutdown always runs in the same order: join every worker, then
//! close every endpoint, then destroy the pool. Rollback after a failed
//! startup reuses the shutdown path.

use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;

use crate::handler::ConnectionHandler;
use crate::infrastructure::config::{Config, PoolConfig, ServerConfig};
use crate::infrastructure::metrics::ServerMetrics;
use crate::infrastructure::pool::{BufferPool, PoolError};
use crate::net::{Endpoint, EndpointError, EndpointFactory, SocketEndpointFactory};
use crate::worker::{Worker, WorkerError, WorkerExit};
use crate::ErrorKind;

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    PoolCreated,
    /// Opening the endpoint and worker of this slot
    Opening(usize),
    Running,
    StoppingWorkers,
    ClosingEndpoints,
    DestroyingPool,
    Stopped,
    /// Startup failed and was rolled back; `at` is the failing slot, if any
    Failed { at: Option<usize> },
}

/// Resource transitions, in the order they happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PoolCreated,
    EndpointOpened(usize),
    WorkerSpawned(usize),
    WorkerJoined(usize),
    EndpointClosed(usize),
    PoolDestroyed,
}

/// What went wrong while filling one slot
#[derive(Debug, Error)]
pub enum StartupFailure {
    #[error("endpoint open failed: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("worker spawn failed: {0}")]
    Spawn(#[from] WorkerError),
}

impl StartupFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StartupFailure::Endpoint(e) => e.kind(),
            StartupFailure::Spawn(e) => e.kind(),
        }
    }
}

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot allocate {workers} worker slots")]
    AllocationFailed { workers: usize },
    #[error("buffer pool creation failed: {0}")]
    Pool(#[from] PoolError),
    #[error("startup failed at slot {index}: {source}")]
    Startup {
        index: usize,
        #[source]
        source: StartupFailure,
    },
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: SupervisorState,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::AllocationFailed { .. } => ErrorKind::AllocationFailed,
            SupervisorError::Pool(e) => e.kind(),
            SupervisorError::Startup { source, .. } => source.kind(),
            SupervisorError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }
}

/// Resolve the configured worker count
///
/// Zero or negative means one worker per available processor, at least two.
/// Positive values are used as given.
pub fn resolve_worker_count(configured: i32, available_processors: usize) -> usize {
    if configured <= 0 {
        available_processors.max(2)
    } else {
        configured as usize
    }
}

fn available_processors() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// One endpoint and the worker accepting on it
#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    endpoint: Option<Endpoint>,
    worker: Option<Worker>,
}

impl WorkerSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Worker task still running its accept loop
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }
}

/// Starts, runs, and tears down the listener fleet
pub struct Supervisor<H: ConnectionHandler, F: EndpointFactory = SocketEndpointFactory> {
    server: ServerConfig,
    pool_config: PoolConfig,
    factory: F,
    handler: Arc<H>,
    metrics: Arc<ServerMetrics>,
    pool: Option<Arc<BufferPool>>,
    slots: Vec<WorkerSlot>,
    workers: usize,
    state: SupervisorState,
    events: Vec<LifecycleEvent>,
}

impl<H: ConnectionHandler> Supervisor<H> {
    /// Supervisor opening real sockets on the configured port
    pub fn new(config: &Config, handler: H) -> Self {
        Self::with_factory(config, handler, SocketEndpointFactory::default())
    }
}

impl<H: ConnectionHandler, F: EndpointFactory> Supervisor<H, F> {
    pub fn with_factory(config: &Config, handler: H, factory: F) -> Self {
        Self {
            server: config.server.clone(),
            pool_config: config.pool.clone(),
            factory,
            handler: Arc::new(handler),
            metrics: Arc::new(ServerMetrics::new()),
            pool: None,
            slots: Vec::new(),
            workers: 0,
            state: SupervisorState::Idle,
            events: Vec::new(),
        }
    }

    /// Bring up the pool, every endpoint, and every worker
    ///
    /// All-or-nothing: on failure everything created so far has been torn
    /// down, in shutdown order, before the error is returned.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::InvalidState {
                action: "start",
                state: self.state,
            });
        }

        let workers = resolve_worker_count(self.server.workers, available_processors());
        self.workers = workers;

        let mut slots = Vec::new();
        if slots.try_reserve_exact(workers).is_err() {
            return Err(self.fail(None, SupervisorError::AllocationFailed { workers }));
        }

        let pool = match BufferPool::create(self.pool_config.min_reserved, self.pool_config.buffer_size) {
            Ok(pool) => Arc::new(pool),
            Err(e) => return Err(self.fail(None, SupervisorError::Pool(e))),
        };
        self.pool = Some(Arc::clone(&pool));
        self.slots = slots;
        self.state = SupervisorState::PoolCreated;
        self.events.push(LifecycleEvent::PoolCreated);

        for index in 0..workers {
            self.state = SupervisorState::Opening(index);

            if let Err(source) = self.open_slot(index, &pool) {
                tracing::error!(slot = index, error = %source, "startup failed, rolling back");
                self.teardown().await;
                return Err(self.fail(Some(index), SupervisorError::Startup { index, source }));
            }
        }

        self.state = SupervisorState::Running;
        tracing::info!(
            port = self.server.port,
            backlog = self.server.backlog,
            workers,
            "fleet started"
        );
        Ok(())
    }

    fn open_slot(&mut self, index: usize, pool: &Arc<BufferPool>) -> Result<(), StartupFailure> {
        let endpoint = self
            .factory
            .open(index, self.server.port, self.server.backlog)?;
        self.events.push(LifecycleEvent::EndpointOpened(index));

        let spawned = endpoint
            .borrow()
            .ok_or_else(|| WorkerError::SpawnFailed {
                index,
                source: io::Error::new(io::ErrorKind::NotConnected, "endpoint closed before its worker started"),
            })
            .and_then(|borrowed| {
                Worker::spawn(
                    index,
                    borrowed,
                    Arc::clone(pool),
                    Arc::clone(&self.handler),
                    Arc::clone(&self.metrics),
                )
            });

        match spawned {
            Ok(worker) => {
                self.events.push(LifecycleEvent::WorkerSpawned(index));
                self.slots.push(WorkerSlot {
                    index,
                    endpoint: Some(endpoint),
                    worker: Some(worker),
                });
                Ok(())
            }
            Err(e) => {
                // This slot's endpoint has no worker yet, close it right away
                close_endpoint(&endpoint, &mut self.events);
                Err(StartupFailure::Spawn(e))
            }
        }
    }

    fn fail(&mut self, at: Option<usize>, err: SupervisorError) -> SupervisorError {
        self.state = SupervisorState::Failed { at };
        tracing::error!(error = %err, "fleet startup failed");
        err
    }

    /// Stop every worker, close every endpoint, destroy the pool
    ///
    /// Waits for each worker to finish with no timeout. Failures along the
    /// way are logged and never skip the remaining steps. Calling this when
    /// the fleet is not running does nothing.
    pub async fn stop(&mut self) {
        if self.state != SupervisorState::Running {
            tracing::debug!(state = ?self.state, "stop ignored");
            return;
        }

        self.teardown().await;
        self.state = SupervisorState::Stopped;

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            workers = self.workers,
            connections = snapshot.connections_accepted,
            failed_workers = snapshot.workers_failed,
            "fleet stopped"
        );
    }

    async fn teardown(&mut self) {
        self.state = SupervisorState::StoppingWorkers;
        for slot in self.slots.iter_mut().rev() {
            let Some(worker) = slot.worker.take() else {
                continue;
            };

            match worker.stop().await {
                Ok(WorkerExit::Stopped) => tracing::debug!(slot = slot.index, "worker joined"),
                Err(e) => tracing::warn!(slot = slot.index, error = %e, "worker ended with error"),
            }
            self.events.push(LifecycleEvent::WorkerJoined(slot.index));
        }

        self.state = SupervisorState::ClosingEndpoints;
        for slot in self.slots.iter_mut().rev() {
            if let Some(endpoint) = slot.endpoint.take() {
                close_endpoint(&endpoint, &mut self.events);
            }
        }
        self.slots.clear();

        self.state = SupervisorState::DestroyingPool;
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.destroy() {
                tracing::warn!(error = %e, "buffer pool destroyed while busy");
            }
            self.events.push(LifecycleEvent::PoolDestroyed);
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Resolved worker count, zero before `start`
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn backlog(&self) -> u16 {
        self.server.backlog
    }

    /// Address of the first open endpoint; every slot shares the same port
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slots
            .iter()
            .filter_map(WorkerSlot::endpoint)
            .find(|endpoint| !endpoint.is_closed())
            .map(Endpoint::local_addr)
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn endpoint(&self, index: usize) -> Option<&Endpoint> {
        self.slots.get(index).and_then(WorkerSlot::endpoint)
    }

    /// Endpoints still open
    pub fn live_endpoints(&self) -> usize {
        self.slots
            .iter()
            .filter_map(WorkerSlot::endpoint)
            .filter(|endpoint| !endpoint.is_closed())
            .count()
    }

    /// Workers still running their accept loop
    pub fn running_workers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_running()).count()
    }

    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.pool.as_ref()
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }
}

fn close_endpoint(endpoint: &Endpoint, events: &mut Vec<LifecycleEvent>) {
    if let Err(e) = endpoint.close() {
        tracing::warn!(slot = endpoint.index(), error = %e, "endpoint shutdown failed");
    }
    events.push(LifecycleEvent::EndpointClosed(endpoint.index()));
}

impl<H: ConnectionHandler, F: EndpointFactory> Drop for Supervisor<H, F> {
    fn drop(&mut self) {
        let live: Vec<&Worker> = self.slots.iter().filter_map(|slot| slot.worker.as_ref()).collect();
        if live.is_empty() {
            return;
        }

        // Can't join here; signal so the tasks exit, endpoints close as slots drop
        tracing::warn!(workers = live.len(), "supervisor dropped while running, workers not joined");
        for worker in live {
            worker.signal();
        }
    }
}
