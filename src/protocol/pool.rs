//! Payload buffer pool
//!
//! Every IP packet crossing the tunnel travels in a [`Payload`] borrowed from
//! the pool and handed back by whichever task consumes it last. Buffers keep a
//! fixed backing capacity of [`BUFFER_SIZE`]; a buffer that was reallocated on
//! the way (capacity changed) is dropped instead of recycled.

use super::PayloadType;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Backing capacity of every pooled buffer
pub const BUFFER_SIZE: usize = 2048;

/// Default number of idle buffers kept around
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// A typed packet buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub ptype: PayloadType,
    pub data: Vec<u8>,
}

impl Payload {
    /// A header-only control payload (DPD, keepalive, disconnect).
    ///
    /// Its capacity never matches the pool, so releasing it drops it.
    pub fn control(ptype: PayloadType) -> Self {
        Self {
            ptype,
            data: Vec::new(),
        }
    }

    /// A data payload carrying a copy of `packet`, outside of any pool
    pub fn data(packet: &[u8]) -> Self {
        Self {
            ptype: PayloadType::Data,
            data: packet.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl PoolStats {
    /// Buffers freshly allocated because the pool was empty
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Buffers discarded on release (foreign capacity or pool full)
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Lock-free pool of fixed-capacity payload buffers
#[derive(Debug)]
pub struct PayloadPool {
    buffers: ArrayQueue<Vec<u8>>,
    stats: PoolStats,
}

impl PayloadPool {
    /// Create a pool keeping at most `capacity` idle buffers
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            stats: PoolStats::default(),
        }
    }

    /// Borrow a buffer: type DATA, length equal to [`BUFFER_SIZE`]
    pub fn acquire(&self) -> Payload {
        let data = match self.buffers.pop() {
            Some(mut buf) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                buf.resize(BUFFER_SIZE, 0);
                buf
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; BUFFER_SIZE]
            }
        };
        Payload {
            ptype: PayloadType::Data,
            data,
        }
    }

    /// Hand a buffer back. Buffers whose capacity drifted are dropped.
    pub fn release(&self, payload: Payload) {
        let mut buf = payload.data;
        if buf.capacity() != BUFFER_SIZE {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.resize(BUFFER_SIZE, 0);
        match self.buffers.push(buf) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of idle buffers
    pub fn idle(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
