//! Proptest strategies for channel and message queue operations

use proptest::prelude::*;

// ════════════════════════════════════════════════════════════
// Channel Operations
// ════════════════════════════════════════════════════════════

/// One step against an output channel
#[derive(Debug, Clone)]
pub enum ChannelOp {
    /// Queue a buffer tagged with `arg`
    Issue(u32),
    /// Complete the oldest pending request
    Complete,
    /// Reclaim without waiting
    Reclaim,
    /// Idle without flushing
    Idle,
}

pub fn channel_op() -> impl Strategy<Value = ChannelOp> {
    prop_oneof![
        4 => any::<u32>().prop_map(ChannelOp::Issue),
        3 => Just(ChannelOp::Complete),
        3 => Just(ChannelOp::Reclaim),
        1 => Just(ChannelOp::Idle),
    ]
}

pub fn channel_ops() -> impl Strategy<Value = Vec<ChannelOp>> {
    prop::collection::vec(channel_op(), 1..64)
}

/// Chirps per channel
pub fn num_bufs() -> impl Strategy<Value = usize> {
    1usize..8
}

// ════════════════════════════════════════════════════════════
// Allocator Operations
// ════════════════════════════════════════════════════════════

/// One step against a pool allocator
#[derive(Debug, Clone)]
pub enum PoolOp {
    /// Allocate a message of this total size
    Alloc(usize),
    /// Free the held message at this index (modulo the held count)
    Free(usize),
}

pub fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        (12usize..=64).prop_map(PoolOp::Alloc),
        any::<usize>().prop_map(PoolOp::Free),
    ]
}

pub fn pool_ops() -> impl Strategy<Value = Vec<PoolOp>> {
    prop::collection::vec(pool_op(), 1..96)
}

// ════════════════════════════════════════════════════════════
// Frames
// ════════════════════════════════════════════════════════════

/// Arbitrary bytes a DSP could put on the message channel
pub fn raw_frame() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..48)
}
