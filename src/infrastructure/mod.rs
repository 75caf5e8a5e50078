//! Infrastructure - everything around the accept path
//!
//! This module contains the supporting pieces:
//! - Configuration loading
//! - Logging setup
//! - Metrics counters
//! - The shared buffer pool

pub mod config;
pub mod logging;
pub mod metrics;
pub mod pool;

pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use pool::{BufferPool, PoolError, PooledBuffer};
