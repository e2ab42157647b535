//! Local Transport - In-memory delivery to GPP queues

use std::sync::Arc;

use log::trace;

use super::Transport;
use crate::error::{LinkError, LinkResult};
use crate::msgq::ldrv::MsgqShared;
use crate::msgq::msg::MsgqMsg;
use crate::types::{MsgqId, ProcessorId, Timeout, ID_GPP};

/// Transport for queues living on the GPP
pub struct LocalTransport {
    shared: Arc<MsgqShared>,
}

impl LocalTransport {
    pub fn new(shared: Arc<MsgqShared>) -> Self {
        Self { shared }
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    fn proc_id(&self) -> ProcessorId {
        ID_GPP
    }

    fn locate(&self, msgq_id: MsgqId, _timeout: Timeout) -> LinkResult<()> {
        if self.shared.is_local_queue(msgq_id) {
            Ok(())
        } else {
            Err(LinkError::NotFound)
        }
    }

    fn put(&self, msg: MsgqMsg) -> Result<(), (LinkError, MsgqMsg)> {
        trace!("mqt local: put to {}", msg.header().dst_msgq);
        self.shared.deliver(msg)
    }

    fn close(&self) -> LinkResult<()> {
        Ok(())
    }
}

impl core::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalTransport").finish()
    }
}
