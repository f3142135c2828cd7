//! Chunk pool: the one process-wide shared buffer resource.
//!
//! Chunks are leased as `BytesMut` and must be returned explicitly with
//! [`ChunkPool::recycle`] or [`ChunkPool::recycle_frozen`]. A leased chunk is
//! owned by exactly one holder at a time; writing it into a stream hands the
//! lease over with it.
//!
//! The pool remembers the storage range of every lease. A returned buffer
//! only ends a lease when it points into one of those ranges, so buffers
//! allocated elsewhere can be handed in without skewing [`ChunkPool::leased`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;

use crate::config::BuffersConfig;

/// Clonable handle to a shared pool of fixed-capacity chunks.
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: ArrayQueue<BytesMut>,
    chunk_size: usize,
    /// Start address to capacity, one entry per outstanding lease.
    leases: Mutex<BTreeMap<usize, usize>>,
    reused: AtomicUsize,
}

impl ChunkPool {
    pub fn new(chunk_size: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(max_pooled.max(1)),
                chunk_size: chunk_size.max(1),
                leases: Mutex::new(BTreeMap::new()),
                reused: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: &BuffersConfig) -> Self {
        Self::new(config.pool_chunk_size, config.pool_max_chunks)
    }

    /// Lease an empty chunk able to hold at least `capacity` bytes.
    ///
    /// Requests between half and all of the pooled size are served from the
    /// free list. Anything else is allocated to size.
    pub fn acquire(&self, capacity: usize) -> BytesMut {
        let buf = if self.is_poolable(capacity) {
            match self.inner.free.pop() {
                Some(mut buf) => {
                    buf.clear();
                    self.inner.reused.fetch_add(1, Ordering::Relaxed);
                    buf
                }
                None => BytesMut::with_capacity(self.inner.chunk_size),
            }
        } else {
            // never zero, so every lease has a distinct address
            BytesMut::with_capacity(capacity.max(1))
        };
        self.leases()
            .insert(buf.as_ptr() as usize, buf.capacity());
        buf
    }

    /// Return a writable chunk. A chunk that was never leased from this pool
    /// may still be kept for reuse, but ends no lease.
    pub fn recycle(&self, mut buf: BytesMut) {
        if !self.release_lease(buf.as_ptr() as usize) {
            tracing::trace!(capacity = buf.capacity(), "recycling a chunk this pool did not lease");
        }
        let cap = buf.capacity();
        if cap >= self.inner.chunk_size && cap <= self.inner.chunk_size * 2 {
            buf.clear();
            if self.inner.free.push(buf).is_err() {
                tracing::trace!("chunk pool full, dropping returned chunk");
            }
        }
    }

    /// Return a frozen chunk. A view whose storage is still shared with
    /// another view is released without giving the storage back; the last
    /// view to be recycled returns it.
    pub fn recycle_frozen(&self, buf: Bytes) {
        match buf.try_into_mut() {
            Ok(unique) => self.recycle(unique),
            Err(shared) => {
                tracing::trace!(len = shared.len(), "chunk storage still shared, releasing view");
            }
        }
    }

    /// Chunks handed out and not yet returned.
    pub fn leased(&self) -> usize {
        self.leases().len()
    }

    /// Free chunks waiting for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// How many leases were satisfied from the free list.
    pub fn reused(&self) -> usize {
        self.inner.reused.load(Ordering::Relaxed)
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    fn is_poolable(&self, capacity: usize) -> bool {
        capacity <= self.inner.chunk_size && capacity * 2 > self.inner.chunk_size
    }

    /// End the lease whose storage contains `addr`. False when no lease does.
    fn release_lease(&self, addr: usize) -> bool {
        let mut leases = self.leases();
        let start = match leases.range(..=addr).next_back() {
            Some((&start, &cap)) if addr < start + cap => start,
            _ => return false,
        };
        leases.remove(&start);
        true
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, usize>> {
        self.inner
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::from_config(&BuffersConfig::default())
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("chunk_size", &self.inner.chunk_size)
            .field("leased", &self.leased())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_chunk_is_reused() {
        let pool = ChunkPool::new(64, 4);
        let mut buf = pool.acquire(64);
        buf.extend_from_slice(b"hello");
        assert_eq!(pool.leased(), 1);

        pool.recycle(buf);
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.available(), 1);

        let again = pool.acquire(40);
        assert!(again.is_empty());
        assert!(again.capacity() >= 64);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn small_and_large_requests_bypass_free_list() {
        let pool = ChunkPool::new(64, 4);
        pool.recycle(BytesMut::with_capacity(64));
        let small = pool.acquire(8);
        let large = pool.acquire(1000);
        assert!(large.capacity() >= 1000);
        assert_eq!(pool.reused(), 0);
        assert_eq!(pool.available(), 1);
        pool.recycle(small);
        pool.recycle(large);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn shared_frozen_views_return_storage_once() {
        let pool = ChunkPool::new(64, 4);
        let mut buf = pool.acquire(64);
        buf.extend_from_slice(&[7u8; 48]);
        let mut frozen = buf.freeze();
        let head = frozen.split_to(16);

        pool.recycle_frozen(head);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.leased(), 1);

        pool.recycle_frozen(frozen);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn foreign_chunks_end_no_lease() {
        let pool = ChunkPool::new(64, 4);
        let held = pool.acquire(64);
        assert_eq!(pool.leased(), 1);

        pool.recycle(BytesMut::with_capacity(64));
        pool.recycle_frozen(Bytes::from(vec![1u8; 16]));
        pool.recycle_frozen(Bytes::from_static(b"static"));
        assert_eq!(pool.leased(), 1);
        assert_eq!(pool.available(), 1);

        pool.recycle(held);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn tail_view_ends_the_lease() {
        let pool = ChunkPool::new(64, 4);
        let mut buf = pool.acquire(64);
        buf.extend_from_slice(&[1u8; 40]);
        let mut frozen = buf.freeze();
        let head = frozen.split_to(8);
        drop(head);
        pool.recycle_frozen(frozen);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn free_list_is_bounded() {
        let pool = ChunkPool::new(32, 2);
        for _ in 0..5 {
            pool.recycle(BytesMut::with_capacity(32));
        }
        assert_eq!(pool.available(), 2);
    }
}
