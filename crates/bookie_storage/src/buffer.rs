//! Fixed-size pool of reusable write buffers.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A bounded pool of equally sized, alignment-multiple buffers.
///
/// Every buffer handed out is `buffer_size` bytes, a multiple of the pool's
/// alignment. [`BufferPool::acquire`] blocks while all buffers are in use;
/// a [`PooledBuffer`] goes back to the pool when dropped.
///
/// The pool is cheap to clone: clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    alignment: usize,
    buffer_size: usize,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    free: Vec<Vec<u8>>,
    closed: bool,
}

impl BufferPool {
    /// Creates a pool of `capacity` buffers of `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPoolConfig`] if `alignment` is not a
    /// power of two, `buffer_size` is not a non-zero multiple of it, or
    /// `capacity` is zero.
    pub fn new(alignment: usize, buffer_size: usize, capacity: usize) -> StorageResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(StorageError::InvalidPoolConfig(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if buffer_size == 0 || buffer_size % alignment != 0 {
            return Err(StorageError::InvalidPoolConfig(format!(
                "buffer size {buffer_size} is not a multiple of alignment {alignment}"
            )));
        }
        if capacity == 0 {
            return Err(StorageError::InvalidPoolConfig(
                "pool needs at least one buffer".into(),
            ));
        }

        let free = (0..capacity).map(|_| vec![0u8; buffer_size]).collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                alignment,
                buffer_size,
                capacity,
                state: Mutex::new(PoolState {
                    free,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Alignment every buffer size and padded length respects.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.inner.alignment
    }

    /// Size in bytes of each buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Total number of buffers owned by the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Takes a buffer, blocking until one is free.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolClosed`] if the pool is closed before a
    /// buffer becomes available.
    pub fn acquire(&self) -> StorageResult<PooledBuffer> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::PoolClosed);
            }
            if let Some(data) = state.free.pop() {
                return Ok(self.wrap(data));
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Takes a buffer, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolClosed`] if the pool is closed.
    pub fn acquire_timeout(&self, timeout: Duration) -> StorageResult<Option<PooledBuffer>> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::PoolClosed);
            }
            if let Some(data) = state.free.pop() {
                return Ok(Some(self.wrap(data)));
            }
            if self
                .inner
                .available
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                return Ok(state.free.pop().map(|data| self.wrap(data)));
            }
        }
    }

    /// Closes the pool, failing current and future waiters.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.free.clear();
        self.inner.available.notify_all();
    }

    fn wrap(&self, data: Vec<u8>) -> PooledBuffer {
        PooledBuffer {
            data,
            len: 0,
            pool: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("alignment", &self.inner.alignment)
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Tracks how many leading bytes have been filled. Returned to the pool on
/// drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Total size of the buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of filled bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been written into the buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space left in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Returns true if the buffer has no free space.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// The filled part of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copies as much of `src` as fits and returns the number of bytes taken.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Fills up to the next alignment boundary with `byte`.
    ///
    /// Returns the padded length.
    pub fn pad_to_alignment(&mut self, byte: u8) -> usize {
        let alignment = self.pool.alignment;
        let padded = self.len.div_ceil(alignment) * alignment;
        self.data[self.len..padded].fill(byte);
        self.len = padded;
        padded
    }

    /// Forgets the filled bytes.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        if state.closed {
            return;
        }
        state.free.push(std::mem::take(&mut self.data));
        self.pool.available.notify_one();
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
