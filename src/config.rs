//! Link configuration
//!
//! Runtime sizing for one link instance. Compile-time limits live in
//! [`crate::types`]; everything here is chosen at setup time.

use crate::error::{LinkError, LinkResult};
use crate::types::MAX_DSPS;

/// Default upper bound on buffers queued per channel
pub const DEFAULT_MAX_BUFS_PER_CHANNEL: usize = 64;

/// Default number of allocator slots
pub const DEFAULT_NUM_MQAS: usize = 4;

/// Default number of transport slots
pub const DEFAULT_NUM_MQTS: usize = 2;

/// Configuration for a link instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Number of DSPs this instance drives (at most `MAX_DSPS`)
    pub num_dsps: usize,
    /// Size of the allocator table
    pub num_mqas: usize,
    /// Size of the transport table
    pub num_mqts: usize,
    /// Largest `num_bufs` a channel may be opened with
    pub max_bufs_per_channel: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            num_dsps: 1,
            num_mqas: DEFAULT_NUM_MQAS,
            num_mqts: DEFAULT_NUM_MQTS,
            max_bufs_per_channel: DEFAULT_MAX_BUFS_PER_CHANNEL,
        }
    }
}

impl LinkConfig {
    pub fn with_num_dsps(mut self, num_dsps: usize) -> Self {
        self.num_dsps = num_dsps;
        self
    }

    pub fn with_num_mqas(mut self, num_mqas: usize) -> Self {
        self.num_mqas = num_mqas;
        self
    }

    pub fn with_num_mqts(mut self, num_mqts: usize) -> Self {
        self.num_mqts = num_mqts;
        self
    }

    pub fn with_max_bufs_per_channel(mut self, max: usize) -> Self {
        self.max_bufs_per_channel = max;
        self
    }

    /// Reject configurations the fixed tables cannot hold
    pub fn validate(&self) -> LinkResult<()> {
        if self.num_dsps == 0 || self.num_dsps > MAX_DSPS {
            return Err(LinkError::InvalidArgument("num_dsps"));
        }
        // Ids are carried as u16 in message headers
        if self.num_mqas == 0 || self.num_mqas > u16::MAX as usize {
            return Err(LinkError::InvalidArgument("num_mqas"));
        }
        if self.num_mqts == 0 || self.num_mqts > u16::MAX as usize {
            return Err(LinkError::InvalidArgument("num_mqts"));
        }
        if self.max_bufs_per_channel == 0 {
            return Err(LinkError::InvalidArgument("max_bufs_per_channel"));
        }
        Ok(())
    }
}
