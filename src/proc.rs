//! Processor Attach Registry
//!
//! A process must attach to a processor before it may create channels or
//! queues on it. Attachments are counted per process so nested
//! attach/detach pairs behave.

use heapless::Vec as FixedVec;
use log::debug;
use spin::RwLock;

use crate::error::{LinkError, LinkResult};
use crate::osal::{PrcsId, PrcsToken};
use crate::types::{ProcessorId, MAX_ATTACHED, MAX_PROCESSORS};

#[derive(Debug, Clone, Copy)]
struct Attachment {
    prcs: PrcsId,
    count: u32,
}

/// Which processes are attached to which processor
#[derive(Debug)]
pub struct ProcRegistry {
    attached: [RwLock<FixedVec<Attachment, MAX_ATTACHED>>; MAX_PROCESSORS],
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self {
            attached: core::array::from_fn(|_| RwLock::new(FixedVec::new())),
        }
    }

    fn slot(&self, proc_id: ProcessorId) -> LinkResult<&RwLock<FixedVec<Attachment, MAX_ATTACHED>>> {
        self.attached
            .get(proc_id.index())
            .ok_or(LinkError::InvalidArgument("processor id"))
    }

    /// Attach the caller to a processor
    pub fn attach(&self, proc_id: ProcessorId, caller: &PrcsToken) -> LinkResult<()> {
        let mut attached = self.slot(proc_id)?.write();
        if let Some(entry) = attached.iter_mut().find(|a| a.prcs == caller.id()) {
            entry.count += 1;
            return Ok(());
        }
        attached
            .push(Attachment {
                prcs: caller.id(),
                count: 1,
            })
            .map_err(|_| LinkError::OutOfMemory)?;
        debug!("proc: {:?} attached to {}", caller.id(), proc_id);
        Ok(())
    }

    /// Undo one [`ProcRegistry::attach`]
    pub fn detach(&self, proc_id: ProcessorId, caller: &PrcsToken) -> LinkResult<()> {
        let mut attached = self.slot(proc_id)?.write();
        let position = attached
            .iter()
            .position(|a| a.prcs == caller.id())
            .ok_or(LinkError::AccessDenied)?;
        attached[position].count -= 1;
        if attached[position].count == 0 {
            attached.swap_remove(position);
            debug!("proc: {:?} detached from {}", caller.id(), proc_id);
        }
        Ok(())
    }

    pub fn is_attached(&self, proc_id: ProcessorId, caller: &PrcsToken) -> bool {
        self.slot(proc_id)
            .map(|slot| slot.read().iter().any(|a| a.prcs == caller.id()))
            .unwrap_or(false)
    }

    /// Fail with `NotAttached` unless the caller is attached
    pub fn check_attached(&self, proc_id: ProcessorId, caller: &PrcsToken) -> LinkResult<()> {
        self.slot(proc_id)?;
        if self.is_attached(proc_id, caller) {
            Ok(())
        } else {
            Err(LinkError::NotAttached(proc_id))
        }
    }
}

impl Default for ProcRegistry {
    fn default() -> Self {
        Self::new()
    }
}
