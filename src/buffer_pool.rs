//! Pooled byte buffers for segment payloads and outgoing packets
//!
//! A [`PooledBuffer`] exclusively owns its bytes until it is dropped, at which
//! point the storage goes back to the [`BufferPool`] it was rented from.
//! Moving the handle moves ownership; releasing twice cannot be expressed.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// Source of reusable byte buffers.
pub trait BufferPool: Send + Sync + 'static {
    /// Rent a cleared buffer with at least `min_capacity` bytes of capacity.
    fn rent(&self, min_capacity: usize) -> BytesMut;

    /// Give a buffer back to the pool.
    fn release(&self, buf: BytesMut);
}

/// Move-only handle to a rented buffer.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    /// Rent a buffer from `pool`.
    pub fn rent(pool: &Arc<dyn BufferPool>, min_capacity: usize) -> Self {
        let mut buf = pool.rent(min_capacity);
        buf.clear();
        if buf.capacity() < min_capacity {
            buf.reserve(min_capacity);
        }
        Self {
            buf,
            pool: pool.clone(),
        }
    }

    /// Rent a buffer and fill it with a copy of `data`.
    pub fn copy_from_slice(pool: &Arc<dyn BufferPool>, data: &[u8]) -> Self {
        let mut buffer = Self::rent(pool, data.len());
        buffer.extend_from_slice(data);
        buffer
    }

    /// Detach the bytes from the pool; they will not be returned.
    pub fn into_bytes(mut self) -> Bytes {
        std::mem::take(&mut self.buf).freeze()
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Detached handles hold an empty, capacity-less buffer
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Single-size lock-free buffer tier using crossbeam-queue
struct PoolTier {
    pool: crossbeam_queue::ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: AtomicUsize,
}

impl PoolTier {
    fn new(max_size: usize, buffer_size: usize) -> Self {
        Self {
            pool: crossbeam_queue::ArrayQueue::new(max_size),
            buffer_size,
            hits: AtomicUsize::new(0),
        }
    }

    fn try_get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    fn try_put(&self, mut buf: BytesMut) {
        // Only keep buffers of roughly this tier's size
        if buf.capacity() >= self.buffer_size / 2 && buf.capacity() <= self.buffer_size * 2 {
            buf.clear();
            let _ = self.pool.push(buf); // Ignore if full
        }
    }
}

/// Tiered lock-free pool.
///
/// Tier thresholds: rent and release use the same boundaries.
///   SMALL:  buffer_size=1024   → rent ≤1024, release accepts capacity ≤2048
///   MEDIUM: buffer_size=1400   → rent ≤1400, release accepts capacity ≤2800
///   LARGE:  buffer_size=8192   → rent ≤8192, release accepts capacity ≤16384
///   JUMBO:  buffer_size=65536  → rent >8192
pub struct DefaultBufferPool {
    small: PoolTier,
    medium: PoolTier,
    large: PoolTier,
    jumbo: PoolTier,
}

impl DefaultBufferPool {
    pub fn new() -> Self {
        Self {
            small: PoolTier::new(4000, 1024),
            medium: PoolTier::new(2000, 1400),
            large: PoolTier::new(1000, 8192),
            jumbo: PoolTier::new(200, 65536),
        }
    }

    /// Process-wide shared pool
    pub fn shared() -> Arc<dyn BufferPool> {
        static SHARED: LazyLock<Arc<DefaultBufferPool>> =
            LazyLock::new(|| Arc::new(DefaultBufferPool::new()));
        SHARED.clone()
    }

    /// Pool statistics per tier: (name, hits, pooled buffers)
    pub fn stats(&self) -> Vec<(&'static str, usize, usize)> {
        [
            ("small", &self.small),
            ("medium", &self.medium),
            ("large", &self.large),
            ("jumbo", &self.jumbo),
        ]
        .into_iter()
        .map(|(name, tier)| (name, tier.hits.load(Ordering::Relaxed), tier.pool.len()))
        .collect()
    }
}

impl Default for DefaultBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool for DefaultBufferPool {
    fn rent(&self, min_capacity: usize) -> BytesMut {
        let mut buf = if min_capacity <= 1024 {
            self.small.try_get()
        } else if min_capacity <= 1400 {
            self.medium.try_get()
        } else if min_capacity <= 8192 {
            self.large.try_get()
        } else {
            self.jumbo.try_get()
        };
        if buf.capacity() < min_capacity {
            buf.reserve(min_capacity - buf.len());
        }
        buf
    }

    fn release(&self, buf: BytesMut) {
        let capacity = buf.capacity();
        if capacity <= 2048 {
            self.small.try_put(buf);
        } else if capacity <= 2800 {
            self.medium.try_put(buf);
        } else if capacity <= 16384 {
            self.large.try_put(buf);
        } else {
            self.jumbo.try_put(buf);
        }
    }
}
