//! # Frame Buffer Allocation
//!
//! Outbound frames are written into buffers obtained from a [`BufferAlloc`].
//! Whoever finishes with a buffer (usually the connection, after the transport
//! send) hands it back with `release`.
//!
//! Pooling is an optimization only. [`Unpooled`] and [`BufferPool`] sit behind
//! the same trait so a codec can be built with either.

use std::sync::Mutex;

/// Source of scratch buffers for encoded frames.
pub trait BufferAlloc: Send + Sync + 'static {
    /// Returns an empty buffer.
    fn acquire(&self) -> Vec<u8>;
    /// Returns a buffer for reuse. Implementations may simply drop it.
    fn release(&self, buf: Vec<u8>);
}

/// Allocates fresh and frees on release.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unpooled;

impl BufferAlloc for Unpooled {
    fn acquire(&self) -> Vec<u8> {
        Vec::new()
    }

    fn release(&self, _buf: Vec<u8>) {}
}

/// A bounded free list of reusable buffers.
///
/// Buffers whose capacity grew beyond `max_capacity` are dropped on release
/// instead of pinning large allocations forever.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    initial_capacity: usize,
    max_capacity: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize, initial_capacity: usize, max_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
            initial_capacity,
            max_capacity,
        }
    }

    /// Buffers currently waiting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, 1024, 64 * 1024)
    }
}

impl BufferAlloc for BufferPool {
    fn acquire(&self) -> Vec<u8> {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        reused.unwrap_or_else(|| Vec::with_capacity(self.initial_capacity))
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_capacity {
            return;
        }
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_buffers {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_released_buffer() {
        let pool = BufferPool::new(2, 16, 1024);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"hello");
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let again = pool.acquire();
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(1, 16, 1024);
        pool.release(Vec::with_capacity(8));
        pool.release(Vec::with_capacity(8));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_pool_drops_oversized_buffers() {
        let pool = BufferPool::new(4, 16, 32);
        pool.release(Vec::with_capacity(1024));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_unpooled_always_fresh() {
        let alloc = Unpooled;
        alloc.release(vec![1, 2, 3]);
        assert!(alloc.acquire().is_empty());
    }
}
