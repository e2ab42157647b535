//! Chirps - Channel I/O Request Packets
//!
//! A chirp describes one queued buffer on a channel: the buffer, the
//! number of valid bytes, an opaque argument passed through unmodified,
//! and the completion status.
//!
//! Each channel owns a fixed-capacity [`ChirpPool`]. Chirp slots are
//! allocated once when the channel opens and then move between three
//! index lists:
//!
//! ```text
//!   free --request()--> requested --complete()--> completed --reclaim()--> free
//!                           |                                                ^
//!                           +-------------- discard_requests() -------------+
//! ```
//!
//! A slot index is on exactly one list at any time, so
//! `free + requested + completed == capacity` always holds.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::types::{ChannelId, ProcessorId};

// ============================================================================
// Completion Status
// ============================================================================

/// Completion status bits of a chirp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChirpStatus(u32);

impl ChirpStatus {
    /// Transfer completed normally
    pub const COMPLETE: Self = Self(0x0000);
    /// Request was cancelled by an idle
    pub const CANCELED: Self = Self(0x0002);
    /// Transfer timed out
    pub const TIMEOUT: Self = Self(0x0008);
    /// Transfer marks end of stream
    pub const EOS: Self = Self(0x4000);
    /// Request still pending
    pub const PENDING: Self = Self(0x8000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::CANCELED.0 | Self::TIMEOUT.0 | Self::EOS.0 | Self::PENDING.0))
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No error bit set
    pub const fn is_complete(&self) -> bool {
        (self.0 & (Self::CANCELED.0 | Self::TIMEOUT.0 | Self::PENDING.0)) == 0
    }

    pub const fn is_canceled(&self) -> bool {
        (self.0 & Self::CANCELED.0) != 0
    }

    pub const fn is_eos(&self) -> bool {
        (self.0 & Self::EOS.0) != 0
    }
}

impl core::ops::BitOr for ChirpStatus {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ChirpStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Default for ChirpStatus {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// I/O Descriptor
// ============================================================================

/// Invoked by the completion path once a chirp completes
///
/// Runs after the channel lock is released but may still be on the
/// driver's completion thread: it must not block.
pub type ChirpCallback = Arc<dyn Fn(ProcessorId, ChannelId, u32, ChirpStatus) + Send + Sync>;

/// Buffer descriptor passed in to issue and handed back on reclaim
pub struct IoInfo {
    /// Data buffer; ownership moves into the channel while queued
    pub buffer: Vec<u8>,
    /// Valid bytes (to send, or received)
    pub size: usize,
    /// Opaque value passed through unmodified
    pub arg: u32,
    /// Completion status (set on reclaim)
    pub status: ChirpStatus,
    /// Optional completion callback
    pub callback: Option<ChirpCallback>,
    /// Callback may run in deferred-interrupt context
    pub dpc_context: bool,
}

impl IoInfo {
    /// Describe `size` valid bytes of `buffer`
    pub fn new(buffer: Vec<u8>, size: usize) -> Self {
        Self {
            buffer,
            size,
            arg: 0,
            status: ChirpStatus::PENDING,
            callback: None,
            dpc_context: false,
        }
    }

    pub fn with_arg(mut self, arg: u32) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_callback(mut self, callback: ChirpCallback, dpc_context: bool) -> Self {
        self.callback = Some(callback);
        self.dpc_context = dpc_context;
        self
    }

    /// Valid bytes of the buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size.min(self.buffer.len())]
    }
}

impl fmt::Debug for IoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoInfo")
            .field("buf_len", &self.buffer.len())
            .field("size", &self.size)
            .field("arg", &self.arg)
            .field("status", &self.status)
            .field("callback", &self.callback.is_some())
            .field("dpc_context", &self.dpc_context)
            .finish()
    }
}

// ============================================================================
// Chirp Slot
// ============================================================================

/// Which list a chirp slot is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChirpList {
    Free,
    Requested,
    Completed,
}

/// Handle naming one chirp slot of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChirpHandle(pub(crate) usize);

/// One I/O request packet
pub struct Chirp {
    buffer: Vec<u8>,
    size: usize,
    arg: u32,
    status: ChirpStatus,
    callback: Option<ChirpCallback>,
    dpc_context: bool,
    list: ChirpList,
}

impl Chirp {
    fn empty() -> Self {
        Self {
            buffer: Vec::new(),
            size: 0,
            arg: 0,
            status: ChirpStatus::empty(),
            callback: None,
            dpc_context: false,
            list: ChirpList::Free,
        }
    }

    fn fill(&mut self, info: IoInfo) {
        self.buffer = info.buffer;
        self.size = info.size;
        self.arg = info.arg;
        self.status = ChirpStatus::PENDING;
        self.callback = info.callback;
        self.dpc_context = info.dpc_context;
    }

    fn take(&mut self) -> IoInfo {
        IoInfo {
            buffer: core::mem::take(&mut self.buffer),
            size: core::mem::take(&mut self.size),
            arg: core::mem::take(&mut self.arg),
            status: core::mem::take(&mut self.status),
            callback: self.callback.take(),
            dpc_context: core::mem::take(&mut self.dpc_context),
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Valid bytes
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size.min(self.buffer.len())]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Record how many bytes the transfer produced
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.buffer.len());
    }

    pub fn arg(&self) -> u32 {
        self.arg
    }

    pub fn status(&self) -> ChirpStatus {
        self.status
    }

    pub fn dpc_context(&self) -> bool {
        self.dpc_context
    }

    pub fn list(&self) -> ChirpList {
        self.list
    }
}

impl fmt::Debug for Chirp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chirp")
            .field("size", &self.size)
            .field("arg", &self.arg)
            .field("status", &self.status)
            .field("list", &self.list)
            .finish()
    }
}

/// What the completion path needs after releasing the channel lock
pub(crate) struct Completed {
    pub arg: u32,
    pub status: ChirpStatus,
    pub callback: Option<ChirpCallback>,
}

// ============================================================================
// Chirp Pool
// ============================================================================

/// Fixed-capacity chirp pool with free, requested and completed lists
#[derive(Debug)]
pub struct ChirpPool {
    slots: Vec<Chirp>,
    free: VecDeque<usize>,
    requested: VecDeque<usize>,
    completed: VecDeque<usize>,
}

impl ChirpPool {
    /// Allocate every slot up front; nothing is allocated afterwards
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Chirp::empty);
        Self {
            slots,
            free: (0..capacity).collect(),
            requested: VecDeque::with_capacity(capacity),
            completed: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn requested_count(&self) -> usize {
        self.requested.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Chirp conservation check
    pub fn is_conserved(&self) -> bool {
        self.free.len() + self.requested.len() + self.completed.len() == self.slots.len()
    }

    /// Queue a request; hands the descriptor back if the pool is exhausted
    pub fn request(&mut self, info: IoInfo) -> Result<ChirpHandle, IoInfo> {
        let Some(index) = self.free.pop_front() else {
            return Err(info);
        };
        let chirp = &mut self.slots[index];
        chirp.fill(info);
        chirp.list = ChirpList::Requested;
        self.requested.push_back(index);
        Ok(ChirpHandle(index))
    }

    /// Oldest pending request
    pub fn head_request(&self) -> Option<ChirpHandle> {
        self.requested.front().copied().map(ChirpHandle)
    }

    /// Pending request by handle
    pub fn requested_chirp(&self, handle: ChirpHandle) -> Option<&Chirp> {
        self.slots
            .get(handle.0)
            .filter(|chirp| chirp.list == ChirpList::Requested)
    }

    pub fn requested_chirp_mut(&mut self, handle: ChirpHandle) -> Option<&mut Chirp> {
        self.slots
            .get_mut(handle.0)
            .filter(|chirp| chirp.list == ChirpList::Requested)
    }

    /// Move a request to the completed list
    pub(crate) fn complete(&mut self, handle: ChirpHandle, status: ChirpStatus) -> Option<Completed> {
        let position = self.requested.iter().position(|&index| index == handle.0)?;
        self.requested.remove(position);
        let chirp = &mut self.slots[handle.0];
        chirp.status = status;
        chirp.list = ChirpList::Completed;
        self.completed.push_back(handle.0);
        Some(Completed {
            arg: chirp.arg,
            status,
            callback: chirp.callback.clone(),
        })
    }

    /// Take back a request nobody has completed yet
    pub(crate) fn withdraw(&mut self, handle: ChirpHandle) -> Option<IoInfo> {
        let position = self.requested.iter().position(|&index| index == handle.0)?;
        self.requested.remove(position);
        let chirp = &mut self.slots[handle.0];
        let info = chirp.take();
        chirp.list = ChirpList::Free;
        self.free.push_back(handle.0);
        Some(info)
    }

    /// Retrieve the oldest completion and return its slot to the free list
    pub fn reclaim(&mut self) -> Option<IoInfo> {
        let index = self.completed.pop_front()?;
        let chirp = &mut self.slots[index];
        let info = chirp.take();
        chirp.list = ChirpList::Free;
        self.free.push_back(index);
        Some(info)
    }

    /// Cancel every pending request, oldest first
    pub fn discard_requests(&mut self) -> Vec<IoInfo> {
        let mut discarded = Vec::with_capacity(self.requested.len());
        while let Some(index) = self.requested.pop_front() {
            let chirp = &mut self.slots[index];
            let mut info = chirp.take();
            info.status = ChirpStatus::CANCELED;
            chirp.list = ChirpList::Free;
            self.free.push_back(index);
            discarded.push(info);
        }
        discarded
    }

    /// Empty both busy lists (channel close)
    pub fn drain(&mut self) -> Vec<IoInfo> {
        let mut drained = self.discard_requests();
        while let Some(info) = self.reclaim() {
            drained.push(info);
        }
        drained
    }
}
