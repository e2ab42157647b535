//! Memory Service
//!
//! Generic buffer allocation used by the channel manager for user data
//! buffers. The service may refuse an allocation with `OutOfMemory`;
//! callers are responsible for rolling back partial work.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{LinkError, LinkResult};

/// Buffer allocation service
pub trait MemoryService: Send + Sync {
    /// Allocate a zeroed buffer of `size` bytes
    fn alloc(&self, size: usize) -> LinkResult<Vec<u8>>;

    /// Return a buffer obtained from [`MemoryService::alloc`]
    fn free(&self, buf: Vec<u8>);
}

/// Heap-backed memory service with an optional byte budget
#[derive(Debug)]
pub struct HeapMemory {
    limit: Option<usize>,
    in_use: AtomicUsize,
}

impl HeapMemory {
    /// Unbounded heap memory
    pub fn new() -> Self {
        Self {
            limit: None,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Heap memory refusing allocations beyond `limit` outstanding bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryService for HeapMemory {
    fn alloc(&self, size: usize) -> LinkResult<Vec<u8>> {
        if size == 0 {
            return Err(LinkError::InvalidArgument("buffer size"));
        }
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(size)?;
                match self.limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return Err(LinkError::OutOfMemory);
        }
        Ok(vec![0u8; size])
    }

    fn free(&self, buf: Vec<u8>) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(buf.len()))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let mem = HeapMemory::new();
        let buf = mem.alloc(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert_eq!(mem.in_use(), 64);
        mem.free(buf);
        assert_eq!(mem.in_use(), 0);
    }

    #[test]
    fn test_limit() {
        let mem = HeapMemory::with_limit(100);
        let a = mem.alloc(60).unwrap();
        assert_eq!(mem.alloc(60), Err(LinkError::OutOfMemory));
        mem.free(a);
        assert!(mem.alloc(60).is_ok());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mem = HeapMemory::new();
        assert_eq!(mem.alloc(0), Err(LinkError::InvalidArgument("buffer size")));
    }
}
