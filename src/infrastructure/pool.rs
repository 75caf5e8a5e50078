//! Shared buffer pool for per-connection processing
//!
//! Pre-allocated, fixed-size byte buffers handed to workers on accept.
//! The pool is a caching allocator with a floor, not a hard cap: it keeps at
//! least `min_reserved` buffers alive and grows on demand when every cached
//! buffer is checked out. Uses crossbeam-queue for lock-free acquire/release.

use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::ErrorKind;

/// Default number of buffers kept in reserve
pub const DEFAULT_MIN_RESERVED: usize = 4;

/// Default size of one processing buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Buffer pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("failed to allocate {bytes} bytes for pool buffer")]
    AllocationFailed { bytes: usize },
    #[error("pool destroyed with {outstanding} buffers still in use")]
    DestroyWhileBusy { outstanding: usize },
    #[error("pool already destroyed")]
    Destroyed,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::AllocationFailed { .. } => ErrorKind::AllocationFailed,
            PoolError::DestroyWhileBusy { .. } => ErrorKind::PoolDestroyWhileBusy,
            PoolError::Destroyed => ErrorKind::PoolDestroyed,
        }
    }
}

/// Growable pool of fixed-size byte buffers
///
/// # Example
/// ```
/// use fleetd::infrastructure::pool::BufferPool;
/// use std::sync::Arc;
///
/// let pool = Arc::new(BufferPool::create(4, 1024).unwrap());
///
/// // Acquire from pool (no allocation while reserves last)
/// let mut buf = pool.acquire().unwrap();
/// buf[0] = 42;
///
/// // Dropping the guard hands the buffer back
/// drop(buf);
/// assert_eq!(pool.outstanding(), 0);
/// ```
pub struct BufferPool {
    free: SegQueue<Vec<u8>>,
    outstanding: AtomicUsize,
    destroyed: AtomicBool,
    min_reserved: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool and pre-populate it with `min_reserved` zeroed buffers
    ///
    /// # Errors
    /// `AllocationFailed` if the allocator cannot satisfy the reservation.
    /// Buffers allocated before the failure are freed on return.
    pub fn create(min_reserved: usize, buffer_size: usize) -> Result<Self, PoolError> {
        let pool = Self {
            free: SegQueue::new(),
            outstanding: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            min_reserved,
            buffer_size,
        };

        for _ in 0..min_reserved {
            pool.free.push(allocate(buffer_size)?);
        }

        tracing::debug!(min_reserved, buffer_size, "buffer pool created");
        Ok(pool)
    }

    /// Acquire a buffer, allocating a fresh one if no cached buffer is free
    ///
    /// Only fails under allocator exhaustion or after `destroy()`.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledBuffer, PoolError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PoolError::Destroyed);
        }

        let buf = match self.free.pop() {
            Some(buf) => buf,
            None => allocate(self.buffer_size)?,
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        // Idle count may briefly overshoot the floor under concurrent release.
        if self.free.len() < self.min_reserved {
            buf.fill(0);
            self.free.push(buf);
        }
    }

    /// Free every cached buffer
    ///
    /// Callers must have quiesced all workers first. Outstanding buffers are
    /// not reclaimed here; they are freed when their guards drop.
    ///
    /// # Errors
    /// `DestroyWhileBusy` if buffers are still checked out. The pool is
    /// destroyed regardless.
    pub fn destroy(&self) -> Result<(), PoolError> {
        let already = self.destroyed.swap(true, Ordering::AcqRel);

        while self.free.pop().is_some() {}

        if !already {
            tracing::debug!("buffer pool destroyed");
        }

        match self.outstanding.load(Ordering::Acquire) {
            0 => Ok(()),
            outstanding => Err(PoolError::DestroyWhileBusy { outstanding }),
        }
    }

    /// Number of cached buffers ready for reuse
    #[inline]
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers currently checked out
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    #[inline]
    pub fn min_reserved(&self) -> usize {
        self.min_reserved
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("outstanding", &self.outstanding())
            .field("min_reserved", &self.min_reserved)
            .field("buffer_size", &self.buffer_size)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Returned to the pool exactly once, when dropped.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

fn allocate(bytes: usize) -> Result<Vec<u8>, PoolError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|_| PoolError::AllocationFailed { bytes })?;
    buf.resize(bytes, 0);
    Ok(buf)
}
