//! Recycles the `BytesMut` read/write buffers each connection checks out,
//! so a busy server doesn't pay an allocation per accepted frame.
//!
//! Backed by `crossbeam_queue::ArrayQueue` for lock-free, bounded pooling:
//! `get()` pops a recycled buffer or allocates fresh; `put()` clears and
//! returns a buffer, dropping it instead if the pool is already full.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// A lock-free pool of `BytesMut` buffers shared by every connection's
/// read/write sides. Tracks hit/miss counts so `Server::cron_tick` can log
/// when traffic has outgrown `pool_size` (below the capacity of every
/// connection's buffers at once, by design — see `Sizing` below).
///
/// # Sizing
///
/// `pool_size` is deliberately smaller than `2 * max_connections`: buffers
/// are only pooled while no connection holds them (between requests, not
/// during), so a pool sized for simultaneous peak occupancy would mostly
/// sit idle. A low hit rate under real traffic is the signal to grow it.
pub struct BytesMutPool {
    pool: ArrayQueue<BytesMut>,
    default_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BytesMutPool {
    /// Panics if `pool_size` or `default_capacity` is 0.
    pub fn new(pool_size: usize, default_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be positive");
        assert!(default_capacity > 0, "default_capacity must be positive");
        Self {
            pool: ArrayQueue::new(pool_size),
            default_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Pops a recycled buffer (cleared, capacity retained) or allocates a
    /// fresh one at `default_capacity`.
    pub fn get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.default_capacity)
            }
        }
    }

    /// Clears `buf` and returns it to the pool. Silently dropped instead if
    /// the pool is already at `pool_size` — traffic spikes shed excess
    /// buffers rather than growing memory without bound.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.pool.push(buf);
    }

    /// Number of buffers currently available for reuse.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Fraction of `get()` calls since startup that reused a pooled buffer
    /// rather than allocating, or `None` if `get()` has never been called.
    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return None;
        }
        Some(hits as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_buffer_with_default_capacity() {
        let pool = BytesMutPool::new(4, 1024);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn get_put_roundtrip_retains_capacity() {
        let pool = BytesMutPool::new(4, 256);

        let mut buf = pool.get();
        buf.extend_from_slice(b"hello world");
        let original_capacity = buf.capacity();
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let recycled = pool.get();
        assert!(recycled.is_empty(), "recycled buffer should be cleared");
        assert_eq!(recycled.capacity(), original_capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_exhaustion_allocates_fresh() {
        let pool = BytesMutPool::new(2, 512);
        let b1 = pool.get();
        let b2 = pool.get();
        let b3 = pool.get();
        assert!(b1.capacity() >= 512);
        assert!(b2.capacity() >= 512);
        assert!(b3.capacity() >= 512);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn capacity_limit_drops_excess() {
        let pool = BytesMutPool::new(2, 64);
        pool.put(BytesMut::with_capacity(64));
        pool.put(BytesMut::with_capacity(64));
        assert_eq!(pool.available(), 2);
        pool.put(BytesMut::with_capacity(64));
        assert_eq!(pool.available(), 2, "pool should not exceed its capacity");
    }

    #[test]
    fn hit_rate_is_none_before_any_get() {
        let pool = BytesMutPool::new(2, 64);
        assert_eq!(pool.hit_rate(), None);
    }

    #[test]
    fn hit_rate_tracks_reuse_vs_fresh_allocation() {
        let pool = BytesMutPool::new(1, 64);
        let _ = pool.get(); // miss, pool starts empty
        assert_eq!(pool.hit_rate(), Some(0.0));

        pool.put(BytesMut::with_capacity(64));
        let _ = pool.get(); // hit
        assert_eq!(pool.hit_rate(), Some(0.5));
    }
}
