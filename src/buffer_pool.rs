// ABOUTME: Fixed-size read buffer pool recycled via Drop instead of deallocated
// ABOUTME: Tracks allocated/recycled counts in PoolStats for diagnostics

//! Fixed-size read buffer pool — spec.md §4.1.
//!
//! A free-list of owned buffers guarded by a mutex, so `acquire`/`release`
//! stay safe if a future reactor hands reads to more than one thread. The
//! pool never deallocates a buffer once it is handed out; dropping a
//! `PooledBuffer` only ever returns it to the free list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Inner {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

/// Point-in-time counts for diagnostics: how many buffers this pool has
/// freshly allocated versus handed out from its free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub recycled: u64,
}

/// A pool of fixed-size byte buffers, recycled to avoid a per-read
/// allocation on the hot path.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Create a pool whose buffers are all `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                free: Mutex::new(Vec::new()),
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    /// The fixed size of every buffer this pool hands out.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Buffers allocated versus recycled so far, for diagnostics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            recycled: self.inner.recycled.load(Ordering::Relaxed),
        }
    }

    /// Take a buffer from the free list, or allocate a fresh one if the free
    /// list is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let mut buf = self.inner.free.lock().expect("buffer pool mutex poisoned").pop();
        if let Some(buf) = &mut buf {
            buf.resize(self.inner.buffer_size, 0);
            self.inner.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        }
        let buf = buf.unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);
        PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }
}

/// A buffer checked out of a [`BufferPool`]. Returned to the pool's free list
/// on drop rather than deallocated.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<Inner>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool
                .free
                .lock()
                .expect("buffer pool mutex poisoned")
                .push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_allocates_when_free_list_empty() {
        let pool = BufferPool::new(128);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn release_recycles_into_free_list() {
        let pool = BufferPool::new(64);
        {
            let buf = pool.acquire();
            assert_eq!(buf.len(), 64);
        } // dropped -> released back to the pool
        assert_eq!(pool.inner.free.lock().unwrap().len(), 1);

        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
        assert_eq!(pool.inner.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn stats_track_allocations_and_recycles() {
        let pool = BufferPool::new(32);
        drop(pool.acquire());
        drop(pool.acquire());
        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
    }
}
