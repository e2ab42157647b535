//! Message Transports
//!
//! A transport moves messages to the queues of one processor. The link
//! keeps a per-processor map to the transport serving it, resolved once
//! when the transport opens:
//! - [`LocalTransport`]: queues on the GPP itself, hand-off in memory
//! - [`RemoteTransport`]: queues on a DSP, framed over the two reserved
//!   message channels

use crate::chnl::Endianism;
use crate::error::{LinkError, LinkResult};
use crate::types::{MqaId, MsgqId, ProcessorId, Timeout};

use super::msg::MsgqMsg;

pub mod local;
pub mod remote;

pub use local::LocalTransport;
pub use remote::RemoteTransport;

/// Operations the queue layer needs from a transport
pub trait Transport: Send + Sync {
    /// Transport name for logs
    fn name(&self) -> &'static str;

    /// Processor whose queues this transport reaches
    fn proc_id(&self) -> ProcessorId;

    /// One attempt at finding `msgq_id`; `NotFound` when it does not exist
    ///
    /// The attempt returns within `timeout`. `NoWait` never blocks.
    fn locate(&self, msgq_id: MsgqId, timeout: Timeout) -> LinkResult<()>;

    /// Forget a successful locate
    fn release(&self, _msgq_id: MsgqId) -> LinkResult<()> {
        Ok(())
    }

    /// Deliver a message whose header is fully stamped
    ///
    /// On failure the message is handed back to the caller.
    fn put(&self, msg: MsgqMsg) -> Result<(), (LinkError, MsgqMsg)>;

    /// Stop the transport; no call succeeds afterwards
    fn close(&self) -> LinkResult<()>;
}

// ============================================================================
// Transport Attributes
// ============================================================================

/// Which transport to open and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAttrs {
    /// Queues of the GPP
    Local,
    /// Queues of a DSP
    Remote(RemoteAttrs),
}

/// Configuration of a remote transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub proc_id: ProcessorId,
    /// Buffers per message channel
    pub num_bufs: usize,
    /// Largest frame (header included) either side may send
    pub max_msg_size: usize,
    pub endianism: Endianism,
    /// Allocator for incoming messages whose own allocator is not open
    pub default_mqa: MqaId,
}

impl RemoteAttrs {
    pub fn new(proc_id: ProcessorId) -> Self {
        Self {
            proc_id,
            num_bufs: 4,
            max_msg_size: 256,
            endianism: Endianism::Default,
            default_mqa: MqaId(0),
        }
    }

    pub fn with_num_bufs(mut self, num_bufs: usize) -> Self {
        self.num_bufs = num_bufs;
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    pub fn with_endianism(mut self, endianism: Endianism) -> Self {
        self.endianism = endianism;
        self
    }

    pub fn with_default_mqa(mut self, mqa_id: MqaId) -> Self {
        self.default_mqa = mqa_id;
        self
    }
}
