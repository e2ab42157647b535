//! Message Allocators
//!
//! An allocator hands out message body buffers and takes them back. The
//! link binds allocators to small integer ids; every message header
//! records the id of the allocator it came from so freeing never needs
//! the caller to repeat it.
//!
//! [`PoolAllocator`] is the stock implementation: a set of fixed-size
//! pools, each filled once at construction. Allocation never touches the
//! heap afterwards.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, trace, warn};
use spin::Mutex;

use super::msg::MSG_HEADER_SIZE;
use crate::error::{LinkError, LinkResult};

/// Operations the link needs from an allocator
pub trait Allocator: Send + Sync {
    /// Allocator name for logs
    fn name(&self) -> &'static str;

    /// Body buffer for a message of `size` total bytes (header included)
    ///
    /// The returned buffer is `size - MSG_HEADER_SIZE` bytes long.
    fn alloc(&self, size: usize) -> LinkResult<Vec<u8>>;

    /// Return a body buffer obtained from `alloc(size)`
    fn free(&self, size: usize, body: Vec<u8>);
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Counters for one pool
#[derive(Debug, Default)]
pub struct PoolCounters {
    pub alloc_count: AtomicU64,
    pub free_count: AtomicU64,
    /// Allocations refused because the pool was empty
    pub failures: AtomicU32,
}

/// Snapshot of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Largest message (header included) the pool serves
    pub msg_size: usize,
    pub total: usize,
    pub free: usize,
    pub alloc_count: u64,
    pub failures: u32,
}

// ============================================================================
// Pool Allocator
// ============================================================================

/// Size and count of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAttrs {
    /// Message size including the header
    pub msg_size: usize,
    pub num_msgs: usize,
}

impl PoolAttrs {
    pub const fn new(msg_size: usize, num_msgs: usize) -> Self {
        Self { msg_size, num_msgs }
    }
}

struct Pool {
    msg_size: usize,
    total: usize,
    free: Mutex<Vec<Vec<u8>>>,
    counters: PoolCounters,
}

impl Pool {
    fn body_len(&self) -> usize {
        self.msg_size - MSG_HEADER_SIZE
    }
}

/// Fixed pools of preallocated message buffers
///
/// A request is served by the smallest pool whose message size fits it.
/// When that pool is empty the request fails rather than spilling into a
/// larger pool, so a buffer always returns to the pool its size selects.
pub struct PoolAllocator {
    pools: Vec<Pool>,
}

impl PoolAllocator {
    pub fn new(attrs: &[PoolAttrs]) -> LinkResult<Self> {
        let mut sorted = attrs.to_vec();
        sorted.sort_by_key(|a| a.msg_size);
        if sorted.is_empty() {
            return Err(LinkError::InvalidArgument("no pools"));
        }

        let mut pools = Vec::with_capacity(sorted.len());
        for (i, a) in sorted.iter().enumerate() {
            if a.msg_size < MSG_HEADER_SIZE || a.msg_size > usize::from(u16::MAX) {
                return Err(LinkError::InvalidArgument("pool msg_size"));
            }
            if a.num_msgs == 0 {
                return Err(LinkError::InvalidArgument("pool num_msgs"));
            }
            if i > 0 && sorted[i - 1].msg_size == a.msg_size {
                return Err(LinkError::InvalidArgument("duplicate pool size"));
            }
            let body_len = a.msg_size - MSG_HEADER_SIZE;
            let mut free = Vec::new();
            free.try_reserve_exact(a.num_msgs)
                .map_err(|_| LinkError::OutOfMemory)?;
            for _ in 0..a.num_msgs {
                let mut body = Vec::new();
                body.try_reserve_exact(body_len)
                    .map_err(|_| LinkError::OutOfMemory)?;
                free.push(body);
            }
            pools.push(Pool {
                msg_size: a.msg_size,
                total: a.num_msgs,
                free: Mutex::new(free),
                counters: PoolCounters::default(),
            });
            debug!("mqa: pool of {} x {} bytes", a.num_msgs, a.msg_size);
        }
        Ok(Self { pools })
    }

    fn pool_for(&self, size: usize) -> Option<&Pool> {
        self.pools.iter().find(|p| p.msg_size >= size)
    }

    /// Per-pool snapshot, smallest pool first
    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|p| PoolStats {
                msg_size: p.msg_size,
                total: p.total,
                free: p.free.lock().len(),
                alloc_count: p.counters.alloc_count.load(Ordering::Relaxed),
                failures: p.counters.failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Allocator for PoolAllocator {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn alloc(&self, size: usize) -> LinkResult<Vec<u8>> {
        if size < MSG_HEADER_SIZE {
            return Err(LinkError::InvalidArgument("message size"));
        }
        let pool = self
            .pool_for(size)
            .ok_or(LinkError::InvalidArgument("message size"))?;
        let Some(mut body) = pool.free.lock().pop() else {
            pool.counters.failures.fetch_add(1, Ordering::Relaxed);
            trace!("mqa: pool {} exhausted", pool.msg_size);
            return Err(LinkError::OutOfMemory);
        };
        pool.counters.alloc_count.fetch_add(1, Ordering::Relaxed);
        body.clear();
        body.resize(size - MSG_HEADER_SIZE, 0);
        Ok(body)
    }

    fn free(&self, size: usize, body: Vec<u8>) {
        let Some(pool) = self.pool_for(size) else {
            warn!("mqa: free of {} byte message matches no pool", size);
            return;
        };
        if body.capacity() < pool.body_len() {
            warn!("mqa: foreign buffer returned to pool {}", pool.msg_size);
            return;
        }
        let mut free = pool.free.lock();
        if free.len() >= pool.total {
            warn!("mqa: pool {} over-freed", pool.msg_size);
            return;
        }
        free.push(body);
        pool.counters.free_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pools", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PoolAllocator {
        PoolAllocator::new(&[PoolAttrs::new(64, 2), PoolAttrs::new(32, 1)]).unwrap()
    }

    #[test]
    fn test_smallest_pool_fits() {
        let mqa = allocator();
        let body = mqa.alloc(20).unwrap();
        assert_eq!(body.len(), 20 - MSG_HEADER_SIZE);
        let stats = mqa.stats();
        assert_eq!(stats[0].msg_size, 32);
        assert_eq!(stats[0].free, 0);
        assert_eq!(stats[1].free, 2);
        mqa.free(20, body);
        assert_eq!(mqa.stats()[0].free, 1);
    }

    #[test]
    fn test_exhaustion() {
        let mqa = allocator();
        let held = mqa.alloc(32).unwrap();
        assert_eq!(mqa.alloc(32), Err(LinkError::OutOfMemory));
        assert_eq!(mqa.stats()[0].failures, 1);
        mqa.free(32, held);
        assert!(mqa.alloc(32).is_ok());
    }

    #[test]
    fn test_bad_sizes() {
        let mqa = allocator();
        assert!(mqa.alloc(4).is_err());
        assert!(mqa.alloc(65).is_err());
        assert!(PoolAllocator::new(&[]).is_err());
        assert!(PoolAllocator::new(&[PoolAttrs::new(8, 1)]).is_err());
        assert!(PoolAllocator::new(&[PoolAttrs::new(16, 1), PoolAttrs::new(16, 2)]).is_err());
    }

    #[test]
    fn test_over_free_ignored() {
        let mqa = allocator();
        mqa.free(32, vec![0; 32]);
        assert_eq!(mqa.stats()[0].free, 1);
    }
}
