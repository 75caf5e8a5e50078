//! Port-reuse TCP listener fleet
//!
//! Supervisory layer for an embedded TCP service: one listening socket per
//! worker, all bound to the same port with `SO_REUSEPORT` so the kernel spreads
//! inbound connections across workers. Startup is all-or-nothing, shutdown is
//! total, ordered, and idempotent.

pub mod handler;
pub mod infrastructure;
pub mod net;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use handler::{Connection, ConnectionHandler, EchoHandler};
pub use infrastructure::config::{Config, ConfigError, LoggingConfig, PoolConfig, ServerConfig};
pub use infrastructure::pool::{BufferPool, PoolError, PooledBuffer};
pub use net::{Endpoint, EndpointError, EndpointFactory, SocketEndpointFactory, SocketOptions};
pub use supervisor::{LifecycleEvent, Supervisor, SupervisorError, SupervisorState};
pub use worker::{Worker, WorkerError, WorkerExit};

use thiserror::Error;

/// Failure classification shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Slot array or pool buffer could not be allocated
    AllocationFailed,
    SocketCreateFailed,
    OptionFailed,
    BindFailed,
    ListenFailed,
    WorkerSpawnFailed,
    /// Pool destroyed while buffers were still checked out
    PoolDestroyWhileBusy,
    /// Buffer requested from a pool that was already destroyed
    PoolDestroyed,
    /// A running worker lost its endpoint or its task
    WorkerFailed,
    /// Operation not valid in the supervisor's current state
    InvalidState,
}

/// Main error type for the listener fleet
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, FleetError>;
