//! Recycling pool for capture buffers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::trace;

use super::frame::{BufferRecycler, FrameMetadata};

/// Bounded pool of reusable buffers. Frames built from it hand their buffer
/// back through [`BufferRecycler`] once released.
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    buffer_size: usize,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub reused: u64,
    /// Buffers handed back by released frames
    pub recycled: u64,
    /// Returned buffers that could not be put back (pool full or still shared)
    pub discarded: u64,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            buffer_size,
            stats: CachePadded::new(Stats::default()),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Pop a free buffer, allocating when the pool is empty.
    pub fn acquire(&self) -> BytesMut {
        match self.free.pop() {
            Some(mut buf) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                buf.resize(self.buffer_size, 0);
                buf
            }
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(self.buffer_size)
            }
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.stats.allocated.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            recycled: self.stats.recycled.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for BufferPool {
    fn recycle(&self, buffer: Bytes, meta: &FrameMetadata) {
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);

        let kept = match buffer.try_into_mut() {
            Ok(mut buf) => {
                buf.clear();
                self.free.push(buf).is_ok()
            }
            // Still shared with a reader that copied the handle
            Err(_) => false,
        };
        if !kept {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
        trace!(sequence = meta.sequence, free = self.free.len(), "buffer recycled");
    }
}
