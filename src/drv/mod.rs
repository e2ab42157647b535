//! Link Drivers
//!
//! The driver is the hardware side of every channel: it moves bytes across
//! the shared-memory boundary and reports completions back to the channel
//! engine. The engine calls the driver once per queued request, always
//! outside any channel lock, so the driver may call straight back into
//! [`ChannelEngine::add_io_completion`].
//!
//! Drivers provided for host use:
//! - [`NullDriver`]: moves nothing; completions are injected by the caller
//! - [`LoopbackDriver`]: pairs data channels and emulates a DSP message peer

use crate::chnl::{ChannelAttrs, ChannelEngine};
use crate::error::LinkResult;
use crate::types::{ChannelId, ProcessorId};

pub mod loopback;

pub use loopback::LoopbackDriver;

/// Operations the channel engine needs from the hardware side
pub trait LinkDriver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &'static str;

    /// A request was queued on `chnl_id`; start whatever transfer is possible
    fn io_request(
        &self,
        engine: &ChannelEngine,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<()>;

    /// Channel opened
    fn channel_opened(&self, _proc_id: ProcessorId, _chnl_id: ChannelId, _attrs: &ChannelAttrs) {}

    /// Channel closed; any in-flight transfer is void
    fn channel_closed(&self, _proc_id: ProcessorId, _chnl_id: ChannelId) {}
}

/// Driver that never moves data
///
/// Completions are delivered by whoever holds the engine, which lets
/// tests decide exactly when each chirp completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl LinkDriver for NullDriver {
    fn name(&self) -> &'static str {
        "null"
    }

    fn io_request(
        &self,
        _engine: &ChannelEngine,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<()> {
        log::trace!("null driver: request on {}/{}", proc_id, chnl_id);
        Ok(())
    }
}
