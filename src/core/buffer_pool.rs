//! Shared relay buffer pool
//!
//! Fixed-size byte buffers reused by every TCP pump and UDP relay in the
//! process. Backed by a lock-free `ArrayQueue`; a checked-out buffer is a
//! [`PooledBuffer`] guard that goes back to the pool exactly once, on drop.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Default buffer size, one relay chunk
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of idle buffers kept by the pool
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Counters describing pool behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers freshly allocated because the pool was empty
    pub allocations: u64,
    /// Buffers handed out from the pool
    pub reuses: u64,
    /// Buffers accepted back into the pool
    pub returns: u64,
    /// Buffers discarded because the pool was full
    pub drops: u64,
}

/// Process-wide pool of relay buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl BufferPool {
    /// Create a pool keeping at most `capacity` idle buffers of `buffer_size` bytes
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size: buffer_size.max(1),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Check out a buffer of `buffer_size` bytes, allocating if the pool is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = match self.buffers.pop() {
            Some(mut buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buffer_size]
            }
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Idle buffers currently held
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A buffer checked out of a [`BufferPool`]
///
/// Dereferences to a `[u8]` of the pool's buffer size. Returned to the pool
/// when dropped; it cannot be touched after that point.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool = Arc::new(BufferPool::new(4, 128));
        let buf = pool.get();
        assert_eq!(buf.len(), 128);
        assert_eq!(pool.stats().allocations, 1);
        assert_eq!(pool.stats().reuses, 0);
    }

    #[test]
    fn test_drop_returns_buffer_once() {
        let pool = Arc::new(BufferPool::new(4, 64));
        {
            let _buf = pool.get();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns, 1);

        let _again = pool.get();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.stats().reuses, 1);
        assert_eq!(pool.stats().allocations, 1);
    }

    #[test]
    fn test_reused_buffer_has_full_length() {
        let pool = Arc::new(BufferPool::new(2, 32));
        {
            let mut buf = pool.get();
            buf[0] = 0xAB;
        }
        let buf = pool.get();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn test_full_pool_drops_extra_buffers() {
        let pool = Arc::new(BufferPool::new(1, 16));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.drops, 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_independent_checkouts() {
        let pool = Arc::new(BufferPool::new(8, 16));
        let mut a = pool.get();
        let mut b = pool.get();
        a[0] = 1;
        b[0] = 2;
        assert_eq!(a[0], 1);
        assert_eq!(b[0], 2);
    }

    #[test]
    fn test_concurrent_checkout_and_return() {
        use std::thread;

        let pool = Arc::new(BufferPool::new(16, 256));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let mut buf = p.get();
                        buf[0] = 7;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations + stats.reuses, 4000);
        assert_eq!(stats.returns + stats.drops, 4000);
        assert!(pool.available() <= 16);
    }
}
