//! Metrics collection for the listener fleet
//!
//! Lock-free counters using atomic operations.
//! Updated by workers, snapshotted by the supervisor for reporting.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Fleet-wide counters
///
/// Thread-safe, shared by every worker via `Arc`.
pub struct ServerMetrics {
    /// Connections handed to the handler
    connections_accepted: CachePadded<AtomicU64>,
    /// Connections currently inside the handler
    active_connections: CachePadded<AtomicU64>,
    /// Accept calls that returned an error
    accept_errors: AtomicU64,
    /// Connections dropped because no buffer could be acquired
    buffer_failures: AtomicU64,
    /// Workers whose accept loop is running
    workers_running: AtomicU64,
    /// Workers that exited with an error
    workers_failed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub accept_errors: u64,
    pub buffer_failures: u64,
    pub workers_running: u64,
    pub workers_failed: u64,
    pub uptime_seconds: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: CachePadded::new(AtomicU64::new(0)),
            active_connections: CachePadded::new(AtomicU64::new(0)),
            accept_errors: AtomicU64::new(0),
            buffer_failures: AtomicU64::new(0),
            workers_running: AtomicU64::new(0),
            workers_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a connection entering the handler
    ///
    /// The returned guard marks it finished when dropped, including on panic.
    #[inline]
    pub fn connection_opened(&self) -> ActiveConnection<'_> {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ActiveConnection { metrics: self }
    }

    #[inline]
    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffer_failure(&self) {
        self.buffer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.workers_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_exited(&self, failed: bool) {
        self.workers_running.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.workers_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            buffer_failures: self.buffer_failures.load(Ordering::Relaxed),
            workers_running: self.workers_running.load(Ordering::Relaxed),
            workers_failed: self.workers_failed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one connection inside the handler
pub struct ActiveConnection<'a> {
    metrics: &'a ServerMetrics,
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
