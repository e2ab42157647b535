//! Msgq Manager - Process ownership over allocators, transports and queues
//!
//! Same discipline as the channel manager: the process that opens an
//! allocator or transport, or creates a queue, is recorded as its owner
//! and is the only one allowed to close or delete it. Locates are
//! non-exclusive; each locating process is tracked independently and may
//! only release its own locates.
//!
//! `get` does not check ownership. The receive path is left open so the
//! hot path costs one table lookup; any process that knows a queue id
//! can read from it.

use std::sync::Arc;

use heapless::Vec as FixedVec;
use log::{debug, warn};
use spin::{Mutex, RwLock};

use super::ldrv::{LdrvMsgq, MsgqLocateAttrs};
use super::mqa::Allocator;
use super::mqt::TransportAttrs;
use super::msg::MsgqMsg;
use crate::error::{LinkError, LinkResult};
use crate::osal::{PrcsId, PrcsToken};
use crate::proc::ProcRegistry;
use crate::types::{
    MqaId, MqtId, MsgqId, ProcessorId, Timeout, MAX_LOCATORS, MAX_MSGQS, MAX_PROCESSORS,
};

type Locators = FixedVec<PrcsId, MAX_LOCATORS>;

/// Ownership layer above the message-queue layer
pub struct MsgqManager {
    ldrv: Arc<LdrvMsgq>,
    procs: Arc<ProcRegistry>,
    mqa_owners: RwLock<Vec<Option<PrcsId>>>,
    mqt_owners: RwLock<Vec<Option<PrcsId>>>,
    msgq_owners: RwLock<[Option<PrcsId>; MAX_MSGQS]>,
    /// Indexed by `proc * MAX_MSGQS + msgq`
    locators: Mutex<Vec<Locators>>,
}

impl MsgqManager {
    /// Owner arrays are sized from the layer's configured table sizes
    pub fn new(ldrv: Arc<LdrvMsgq>, procs: Arc<ProcRegistry>) -> Self {
        let mut mqa_owners = Vec::with_capacity(ldrv.num_mqas());
        mqa_owners.resize(ldrv.num_mqas(), None);
        let mut mqt_owners = Vec::with_capacity(ldrv.num_mqts());
        mqt_owners.resize(ldrv.num_mqts(), None);
        let mut locators = Vec::with_capacity(MAX_PROCESSORS * MAX_MSGQS);
        locators.resize_with(MAX_PROCESSORS * MAX_MSGQS, FixedVec::new);
        Self {
            ldrv,
            procs,
            mqa_owners: RwLock::new(mqa_owners),
            mqt_owners: RwLock::new(mqt_owners),
            msgq_owners: RwLock::new([None; MAX_MSGQS]),
            locators: Mutex::new(locators),
        }
    }

    pub fn ldrv(&self) -> &Arc<LdrvMsgq> {
        &self.ldrv
    }

    fn locator_index(proc_id: ProcessorId, msgq_id: MsgqId) -> LinkResult<usize> {
        if proc_id.index() >= MAX_PROCESSORS {
            return Err(LinkError::InvalidArgument("processor id"));
        }
        if msgq_id.index() >= MAX_MSGQS {
            return Err(LinkError::InvalidArgument("msgq id"));
        }
        Ok(proc_id.index() * MAX_MSGQS + msgq_id.index())
    }

    /// Claim `owners[index]` for `caller`, run `open`, release the claim if it fails
    fn claim_then(
        owners: &RwLock<Vec<Option<PrcsId>>>,
        index: usize,
        what: &'static str,
        caller: &PrcsToken,
        open: impl FnOnce() -> LinkResult<()>,
    ) -> LinkResult<()> {
        {
            let mut owners = owners.write();
            let slot = owners.get_mut(index).ok_or(LinkError::InvalidArgument(what))?;
            if slot.is_some() {
                return Err(LinkError::AlreadyExists);
            }
            *slot = Some(caller.id());
        }
        if let Err(e) = open() {
            owners.write()[index] = None;
            return Err(e);
        }
        Ok(())
    }

    fn authorize(
        owners: &RwLock<Vec<Option<PrcsId>>>,
        index: usize,
        what: &'static str,
        caller: &PrcsToken,
    ) -> LinkResult<()> {
        let owner = *owners
            .read()
            .get(index)
            .ok_or(LinkError::InvalidArgument(what))?;
        if caller.owns(owner) {
            Ok(())
        } else {
            Err(LinkError::AccessDenied)
        }
    }

    // ========================================================================
    // Allocators
    // ========================================================================

    pub fn allocator_open(
        &self,
        caller: &PrcsToken,
        mqa_id: MqaId,
        allocator: Arc<dyn Allocator>,
    ) -> LinkResult<()> {
        Self::claim_then(&self.mqa_owners, mqa_id.index(), "allocator id", caller, || {
            self.ldrv.allocator_open(mqa_id, allocator)
        })?;
        debug!("pmgr msgq: {:?} owns allocator {}", caller.id(), mqa_id);
        Ok(())
    }

    pub fn allocator_close(&self, caller: &PrcsToken, mqa_id: MqaId) -> LinkResult<()> {
        Self::authorize(&self.mqa_owners, mqa_id.index(), "allocator id", caller)?;
        self.ldrv.allocator_close(mqa_id)?;
        self.mqa_owners.write()[mqa_id.index()] = None;
        Ok(())
    }

    pub fn allocator_owner(&self, mqa_id: MqaId) -> Option<PrcsId> {
        self.mqa_owners.read().get(mqa_id.index()).copied().flatten()
    }

    // ========================================================================
    // Transports
    // ========================================================================

    /// Open a transport; a remote one needs the caller attached to its DSP
    pub fn transport_open(&self, caller: &PrcsToken, mqt_id: MqtId, attrs: &TransportAttrs) -> LinkResult<()> {
        if mqt_id.index() >= self.ldrv.num_mqts() {
            return Err(LinkError::InvalidArgument("transport id"));
        }
        if let TransportAttrs::Remote(remote) = attrs {
            self.procs.check_attached(remote.proc_id, caller)?;
        }
        Self::claim_then(&self.mqt_owners, mqt_id.index(), "transport id", caller, || {
            self.ldrv.transport_open(mqt_id, attrs)
        })?;
        debug!("pmgr msgq: {:?} owns transport {}", caller.id(), mqt_id);
        Ok(())
    }

    /// Close a transport; locates made through it are dropped for every process
    pub fn transport_close(&self, caller: &PrcsToken, mqt_id: MqtId) -> LinkResult<()> {
        Self::authorize(&self.mqt_owners, mqt_id.index(), "transport id", caller)?;
        let proc_id = self.ldrv.transport_close(mqt_id)?;
        let first = proc_id.index() * MAX_MSGQS;
        for list in &mut self.locators.lock()[first..first + MAX_MSGQS] {
            list.clear();
        }
        self.mqt_owners.write()[mqt_id.index()] = None;
        Ok(())
    }

    pub fn transport_owner(&self, mqt_id: MqtId) -> Option<PrcsId> {
        self.mqt_owners.read().get(mqt_id.index()).copied().flatten()
    }

    // ========================================================================
    // Queues
    // ========================================================================

    pub fn create(&self, caller: &PrcsToken, msgq_id: MsgqId) -> LinkResult<()> {
        {
            let mut owners = self.msgq_owners.write();
            let slot = owners
                .get_mut(msgq_id.index())
                .ok_or(LinkError::InvalidArgument("msgq id"))?;
            if slot.is_some() {
                return Err(LinkError::AlreadyExists);
            }
            *slot = Some(caller.id());
        }
        if let Err(e) = self.ldrv.create(msgq_id) {
            self.msgq_owners.write()[msgq_id.index()] = None;
            return Err(e);
        }
        debug!("pmgr msgq: {:?} owns {}", caller.id(), msgq_id);
        Ok(())
    }

    pub fn delete(&self, caller: &PrcsToken, msgq_id: MsgqId) -> LinkResult<()> {
        self.authorize_msgq(caller, msgq_id)?;
        self.ldrv.delete(msgq_id)?;
        self.msgq_owners.write()[msgq_id.index()] = None;
        Ok(())
    }

    pub fn msgq_owner(&self, msgq_id: MsgqId) -> Option<PrcsId> {
        self.msgq_owners.read().get(msgq_id.index()).copied().flatten()
    }

    fn authorize_msgq(&self, caller: &PrcsToken, msgq_id: MsgqId) -> LinkResult<()> {
        let owner = *self
            .msgq_owners
            .read()
            .get(msgq_id.index())
            .ok_or(LinkError::InvalidArgument("msgq id"))?;
        if caller.owns(owner) {
            Ok(())
        } else {
            Err(LinkError::AccessDenied)
        }
    }

    /// Locate a queue on `proc_id`; `NotFound` means try again later
    pub fn locate(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        msgq_id: MsgqId,
        attrs: &MsgqLocateAttrs,
    ) -> LinkResult<()> {
        let index = Self::locator_index(proc_id, msgq_id)?;
        if self.locators.lock()[index].is_full() {
            return Err(LinkError::OutOfMemory);
        }
        self.ldrv.locate(proc_id, msgq_id, attrs)?;

        if self.locators.lock()[index].push(caller.id()).is_err() {
            warn!("pmgr msgq: locator table for {}/{} filled during locate", proc_id, msgq_id);
            self.ldrv.release(proc_id, msgq_id)?;
            return Err(LinkError::OutOfMemory);
        }
        Ok(())
    }

    /// Undo one of the caller's own locates
    pub fn release(&self, caller: &PrcsToken, proc_id: ProcessorId, msgq_id: MsgqId) -> LinkResult<()> {
        let index = Self::locator_index(proc_id, msgq_id)?;
        {
            let mut locators = self.locators.lock();
            let list = &mut locators[index];
            let position = list
                .iter()
                .position(|p| *p == caller.id())
                .ok_or(LinkError::AccessDenied)?;
            list.swap_remove(position);
        }
        self.ldrv.release(proc_id, msgq_id)
    }

    /// Processes currently holding a locate on `proc_id`/`msgq_id`
    pub fn locator_count(&self, proc_id: ProcessorId, msgq_id: MsgqId) -> usize {
        Self::locator_index(proc_id, msgq_id)
            .map(|index| self.locators.lock()[index].len())
            .unwrap_or(0)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    pub fn alloc(&self, mqa_id: MqaId, size: usize) -> LinkResult<MsgqMsg> {
        self.ldrv.alloc(mqa_id, size)
    }

    pub fn free(&self, msg: MsgqMsg) -> LinkResult<()> {
        self.ldrv.free(msg)
    }

    /// Send a message; it is handed back on failure
    pub fn put(
        &self,
        proc_id: ProcessorId,
        dst: MsgqId,
        msg: MsgqMsg,
        msg_id: u16,
        src: MsgqId,
    ) -> Result<(), (LinkError, MsgqMsg)> {
        self.ldrv.put(proc_id, dst, msg, msg_id, src)
    }

    /// Receive from a queue (no ownership check)
    pub fn get(&self, msgq_id: MsgqId, timeout: Timeout) -> LinkResult<MsgqMsg> {
        self.ldrv.get(msgq_id, timeout)
    }

    pub fn get_reply_id(&self, msg: &MsgqMsg) -> LinkResult<(ProcessorId, MsgqId)> {
        self.ldrv.get_reply_id(msg)
    }

    pub fn count(&self, msgq_id: MsgqId) -> LinkResult<usize> {
        self.ldrv.count(msgq_id)
    }

    /// Route asynchronous errors to a queue the caller owns
    ///
    /// `MsgqId::INVALID` removes the handler; only the handler's owner
    /// may do that.
    pub fn set_error_handler(&self, caller: &PrcsToken, msgq_id: MsgqId, mqa_id: MqaId) -> LinkResult<()> {
        if msgq_id.is_valid() {
            self.authorize_msgq(caller, msgq_id)?;
        }
        self.ldrv.set_error_handler(msgq_id, mqa_id)
    }

    // ========================================================================
    // Process exit
    // ========================================================================

    /// Release everything `caller` still holds
    ///
    /// Returns how many objects were released.
    pub fn cleanup(&self, caller: &PrcsToken) -> usize {
        let mut released = 0;

        for proc in 0..MAX_PROCESSORS {
            for msgq in 0..MAX_MSGQS {
                let (proc_id, msgq_id) = (ProcessorId(proc as u16), MsgqId(msgq as u16));
                while self.release(caller, proc_id, msgq_id).is_ok() {
                    released += 1;
                }
            }
        }
        for msgq in 0..MAX_MSGQS {
            let msgq_id = MsgqId(msgq as u16);
            if caller.owns(self.msgq_owner(msgq_id)) {
                match self.delete(caller, msgq_id) {
                    Ok(()) => released += 1,
                    Err(e) => warn!("pmgr msgq: cleanup of {} failed: {}", msgq_id, e),
                }
            }
        }
        for mqt in 0..self.ldrv.num_mqts() {
            let mqt_id = MqtId(mqt as u16);
            if caller.owns(self.transport_owner(mqt_id)) {
                match self.transport_close(caller, mqt_id) {
                    Ok(()) => released += 1,
                    Err(e) => warn!("pmgr msgq: cleanup of transport {} failed: {}", mqt_id, e),
                }
            }
        }
        for mqa in 0..self.ldrv.num_mqas() {
            let mqa_id = MqaId(mqa as u16);
            if caller.owns(self.allocator_owner(mqa_id)) {
                match self.allocator_close(caller, mqa_id) {
                    Ok(()) => released += 1,
                    Err(e) => warn!("pmgr msgq: cleanup of allocator {} failed: {}", mqa_id, e),
                }
            }
        }
        released
    }
}

impl core::fmt::Debug for MsgqManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MsgqManager").field("ldrv", &self.ldrv).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chnl::ChannelEngine;
    use crate::config::LinkConfig;
    use crate::drv::NullDriver;
    use crate::msgq::mqa::{PoolAllocator, PoolAttrs};
    use crate::types::ID_GPP;

    fn manager() -> MsgqManager {
        let engine = Arc::new(ChannelEngine::new(1, 8, Arc::new(NullDriver)));
        let config = LinkConfig::default().with_num_mqas(2).with_num_mqts(2);
        let ldrv = Arc::new(LdrvMsgq::setup(&config, engine).unwrap());
        MsgqManager::new(ldrv, Arc::new(ProcRegistry::new()))
    }

    fn pools() -> Arc<PoolAllocator> {
        Arc::new(PoolAllocator::new(&[PoolAttrs::new(32, 4)]).unwrap())
    }

    #[test]
    fn test_out_of_range_ids_leave_no_owner() {
        let pmgr = manager();
        let caller = PrcsToken::create();
        assert_eq!(
            pmgr.allocator_open(&caller, MqaId(2), pools()),
            Err(LinkError::InvalidArgument("allocator id"))
        );
        assert_eq!(pmgr.allocator_owner(MqaId(2)), None);
        assert_eq!(
            pmgr.transport_open(&caller, MqtId(2), &TransportAttrs::Local),
            Err(LinkError::InvalidArgument("transport id"))
        );
        assert_eq!(pmgr.transport_owner(MqtId(2)), None);
        assert_eq!(pmgr.transport_owner(MqtId(0)), None);
    }

    #[test]
    fn test_owner_gate() {
        let pmgr = manager();
        let owner = PrcsToken::create();
        let other = PrcsToken::create();

        pmgr.allocator_open(&owner, MqaId(0), pools()).unwrap();
        pmgr.transport_open(&owner, MqtId(0), &TransportAttrs::Local).unwrap();
        pmgr.create(&owner, MsgqId(1)).unwrap();

        assert_eq!(pmgr.allocator_close(&other, MqaId(0)), Err(LinkError::AccessDenied));
        assert_eq!(pmgr.transport_close(&other, MqtId(0)), Err(LinkError::AccessDenied));
        assert_eq!(pmgr.delete(&other, MsgqId(1)), Err(LinkError::AccessDenied));
        assert_eq!(
            pmgr.set_error_handler(&other, MsgqId(1), MqaId(0)),
            Err(LinkError::AccessDenied)
        );
        assert_eq!(pmgr.create(&other, MsgqId(1)), Err(LinkError::AlreadyExists));

        // Anyone may send to and read from the queue
        let msg = pmgr.alloc(MqaId(0), 16).unwrap();
        pmgr.put(ID_GPP, MsgqId(1), msg, 3, MsgqId::INVALID).unwrap();
        let msg = pmgr.get(MsgqId(1), Timeout::NoWait).unwrap();
        pmgr.free(msg).unwrap();

        pmgr.delete(&owner, MsgqId(1)).unwrap();
        assert_eq!(pmgr.msgq_owner(MsgqId(1)), None);
    }

    #[test]
    fn test_failed_create_releases_owner() {
        let pmgr = manager();
        let caller = PrcsToken::create();
        pmgr.ldrv().create(MsgqId(4)).unwrap();
        assert_eq!(pmgr.create(&caller, MsgqId(4)), Err(LinkError::AlreadyExists));
        assert_eq!(pmgr.msgq_owner(MsgqId(4)), None);
    }

    #[test]
    fn test_locators_are_independent() {
        let pmgr = manager();
        let owner = PrcsToken::create();
        let a = PrcsToken::create();
        let b = PrcsToken::create();
        pmgr.transport_open(&owner, MqtId(0), &TransportAttrs::Local).unwrap();
        pmgr.create(&owner, MsgqId(2)).unwrap();

        let attrs = MsgqLocateAttrs::new(Timeout::NoWait);
        pmgr.locate(&a, ID_GPP, MsgqId(2), &attrs).unwrap();
        pmgr.locate(&b, ID_GPP, MsgqId(2), &attrs).unwrap();
        assert_eq!(pmgr.locator_count(ID_GPP, MsgqId(2)), 2);

        pmgr.release(&a, ID_GPP, MsgqId(2)).unwrap();
        assert_eq!(pmgr.release(&a, ID_GPP, MsgqId(2)), Err(LinkError::AccessDenied));
        assert_eq!(pmgr.locator_count(ID_GPP, MsgqId(2)), 1);
        pmgr.release(&b, ID_GPP, MsgqId(2)).unwrap();
    }

    #[test]
    fn test_transport_close_drops_locates() {
        let pmgr = manager();
        let owner = PrcsToken::create();
        let a = PrcsToken::create();
        let attrs = MsgqLocateAttrs::new(Timeout::NoWait);
        pmgr.transport_open(&owner, MqtId(0), &TransportAttrs::Local).unwrap();
        pmgr.create(&owner, MsgqId(2)).unwrap();
        pmgr.locate(&a, ID_GPP, MsgqId(2), &attrs).unwrap();

        pmgr.transport_close(&owner, MqtId(0)).unwrap();
        assert_eq!(pmgr.locator_count(ID_GPP, MsgqId(2)), 0);

        // Reopened transport: the old locate is gone on both layers
        pmgr.transport_open(&owner, MqtId(0), &TransportAttrs::Local).unwrap();
        assert_eq!(pmgr.release(&a, ID_GPP, MsgqId(2)), Err(LinkError::AccessDenied));
        pmgr.locate(&a, ID_GPP, MsgqId(2), &attrs).unwrap();
        pmgr.release(&a, ID_GPP, MsgqId(2)).unwrap();
        assert_eq!(pmgr.cleanup(&a), 0);
    }

    #[test]
    fn test_remote_transport_needs_attach() {
        let pmgr = manager();
        let caller = PrcsToken::create();
        let attrs = TransportAttrs::Remote(crate::msgq::mqt::RemoteAttrs::new(ProcessorId(0)));
        assert_eq!(
            pmgr.transport_open(&caller, MqtId(1), &attrs),
            Err(LinkError::NotAttached(ProcessorId(0)))
        );
        assert_eq!(pmgr.transport_owner(MqtId(1)), None);
    }

    #[test]
    fn test_cleanup() {
        let pmgr = manager();
        let caller = PrcsToken::create();
        pmgr.allocator_open(&caller, MqaId(1), pools()).unwrap();
        pmgr.transport_open(&caller, MqtId(0), &TransportAttrs::Local).unwrap();
        pmgr.create(&caller, MsgqId(3)).unwrap();
        pmgr.locate(&caller, ID_GPP, MsgqId(3), &MsgqLocateAttrs::new(Timeout::NoWait))
            .unwrap();

        assert_eq!(pmgr.cleanup(&caller), 4);
        assert_eq!(pmgr.allocator_owner(MqaId(1)), None);
        assert_eq!(pmgr.transport_owner(MqtId(0)), None);
        assert_eq!(pmgr.msgq_owner(MsgqId(3)), None);
    }
}
