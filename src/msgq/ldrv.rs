//! Message Queue Layer - Queues, allocators and transport dispatch
//!
//! Holds the allocator table, the transport table, the per-processor map
//! from processor to transport, the local receive queues and the error
//! handler slot. Like the channel engine it trusts its caller; ownership
//! is enforced one layer up in [`crate::msgq::pmgr`].
//!
//! State reachable from transports (allocators, queues, error handler)
//! lives in [`MsgqShared`] so a remote transport's receiver thread can
//! deliver without going through this layer.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};
use spin::{Mutex, RwLock};

use super::mqa::Allocator;
use super::msg::{MsgHeader, MsgqAsyncError, MsgqMsg, MSGQ_ASYNC_ERROR_MSGID, MSG_HEADER_SIZE};
use super::mqt::{LocalTransport, RemoteTransport, Transport, TransportAttrs};
use crate::chnl::ChannelEngine;
use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::osal::{Deadline, SyncSemaphore};
use crate::types::{MqaId, MqtId, MsgqId, ProcessorId, Timeout, ID_GPP, MAX_MSGQS, MAX_PROCESSORS};

/// First pause between locate attempts
const LOCATE_BACKOFF_START_MS: u64 = 1;

/// Longest pause between locate attempts
const LOCATE_BACKOFF_MAX_MS: u64 = 64;

// ============================================================================
// Queue Object
// ============================================================================

/// Status of a queue id as seen from the GPP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgqStatus {
    /// Neither created locally nor located
    Empty,
    /// Created locally, or located on a remote processor
    InUse,
    /// A locate is in flight and nothing is located yet
    LocatePending,
}

/// Attributes of a locate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgqLocateAttrs {
    /// Bound on the whole call; `NoWait` makes a single attempt
    pub timeout: Timeout,
}

impl MsgqLocateAttrs {
    pub fn new(timeout: Timeout) -> Self {
        Self { timeout }
    }
}

/// A local receive queue
pub struct MsgqObject {
    id: MsgqId,
    get_sem: SyncSemaphore,
    messages: Mutex<VecDeque<MsgqMsg>>,
    deleted: AtomicBool,
}

impl MsgqObject {
    fn new(id: MsgqId) -> Self {
        Self {
            id,
            get_sem: SyncSemaphore::new(0),
            messages: Mutex::new(VecDeque::new()),
            deleted: AtomicBool::new(false),
        }
    }

    fn push(&self, msg: MsgqMsg) -> Result<(), (LinkError, MsgqMsg)> {
        {
            let mut messages = self.messages.lock();
            if self.deleted.load(Ordering::Acquire) {
                return Err((LinkError::NotFound, msg));
            }
            messages.push_back(msg);
        }
        self.get_sem.post();
        Ok(())
    }

    fn get(&self, timeout: Timeout) -> LinkResult<MsgqMsg> {
        self.get_sem.wait(timeout)?;
        if self.deleted.load(Ordering::Acquire) {
            return Err(LinkError::GeneralFailure("queue deleted"));
        }
        self.messages
            .lock()
            .pop_front()
            .ok_or(LinkError::GeneralFailure("queue out of step"))
    }

    /// Mark deleted, wake a blocked receiver and hand back queued messages
    fn shut(&self) -> Vec<MsgqMsg> {
        let drained: Vec<MsgqMsg> = {
            let mut messages = self.messages.lock();
            self.deleted.store(true, Ordering::Release);
            messages.drain(..).collect()
        };
        self.get_sem.post();
        drained
    }

    pub fn id(&self) -> MsgqId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ErrorHandler {
    msgq_id: MsgqId,
    mqa_id: MqaId,
}

/// State reachable from transports
pub struct MsgqShared {
    allocators: RwLock<Vec<Option<Arc<dyn Allocator>>>>,
    queues: RwLock<Vec<Option<Arc<MsgqObject>>>>,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl MsgqShared {
    fn new(num_mqas: usize) -> Self {
        let mut allocators = Vec::with_capacity(num_mqas);
        allocators.resize_with(num_mqas, || None);
        let mut queues = Vec::with_capacity(MAX_MSGQS);
        queues.resize_with(MAX_MSGQS, || None);
        Self {
            allocators: RwLock::new(allocators),
            queues: RwLock::new(queues),
            error_handler: Mutex::new(None),
        }
    }

    fn allocator(&self, mqa_id: MqaId) -> LinkResult<Arc<dyn Allocator>> {
        self.allocators
            .read()
            .get(mqa_id.index())
            .ok_or(LinkError::InvalidArgument("allocator id"))?
            .clone()
            .ok_or(LinkError::NotFound)
    }

    pub fn has_allocator(&self, mqa_id: MqaId) -> bool {
        self.allocator(mqa_id).is_ok()
    }

    /// Allocate a message of `size` bytes (header included)
    pub fn alloc(&self, mqa_id: MqaId, size: usize) -> LinkResult<MsgqMsg> {
        if size < MSG_HEADER_SIZE || size > usize::from(u16::MAX) {
            return Err(LinkError::InvalidArgument("message size"));
        }
        let body = self.allocator(mqa_id)?.alloc(size)?;
        Ok(MsgqMsg::from_parts(MsgHeader::new(size as u16, mqa_id), body))
    }

    /// Return a message to the allocator named in its header
    pub fn free(&self, msg: MsgqMsg) -> LinkResult<()> {
        let allocator = self.allocator(msg.mqa_id())?;
        let (header, body) = msg.into_parts();
        allocator.free(header.size as usize, body);
        Ok(())
    }

    fn queue(&self, msgq_id: MsgqId) -> Option<Arc<MsgqObject>> {
        self.queues.read().get(msgq_id.index())?.clone()
    }

    pub fn is_local_queue(&self, msgq_id: MsgqId) -> bool {
        self.queue(msgq_id).is_some()
    }

    /// Append a message to the local queue named by its destination
    pub fn deliver(&self, msg: MsgqMsg) -> Result<(), (LinkError, MsgqMsg)> {
        match self.queue(msg.header().dst_msgq) {
            Some(queue) => queue.push(msg),
            None => Err((LinkError::NotFound, msg)),
        }
    }

    /// Send an asynchronous error to the registered handler queue
    pub fn send_error_msg(&self, error: &MsgqAsyncError) -> LinkResult<()> {
        let handler = (*self.error_handler.lock()).ok_or(LinkError::NotFound)?;
        let mut msg = self.alloc(handler.mqa_id, MSG_HEADER_SIZE + MsgqAsyncError::BODY_SIZE)?;
        if let Err(e) = error.encode(msg.body_mut()) {
            self.free(msg)?;
            return Err(e);
        }
        let header = msg.header_mut();
        header.msg_id = MSGQ_ASYNC_ERROR_MSGID;
        header.src_proc = ID_GPP;
        header.src_msgq = MsgqId::INVALID;
        header.dst_msgq = handler.msgq_id;

        if let Err((e, msg)) = self.deliver(msg) {
            self.free(msg)?;
            return Err(e);
        }
        debug!("msgq: async error {:?} sent to {}", error.kind, handler.msgq_id);
        Ok(())
    }
}

// ============================================================================
// Queue Layer
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Located {
    status: MsgqStatus,
    count: u32,
}

impl Located {
    const EMPTY: Self = Self {
        status: MsgqStatus::Empty,
        count: 0,
    };
}

type LocatedTable = [[Located; MAX_MSGQS]; MAX_PROCESSORS];

/// The message-queue subsystem of one link
pub struct LdrvMsgq {
    engine: Arc<ChannelEngine>,
    shared: Arc<MsgqShared>,
    transports: RwLock<Vec<Option<Arc<dyn Transport>>>>,
    proc_mqt: RwLock<[Option<MqtId>; MAX_PROCESSORS]>,
    located: Mutex<LocatedTable>,
}

impl LdrvMsgq {
    /// Allocate the allocator, transport and queue tables
    pub fn setup(config: &LinkConfig, engine: Arc<ChannelEngine>) -> LinkResult<Self> {
        config.validate()?;
        let mut transports = Vec::with_capacity(config.num_mqts);
        transports.resize_with(config.num_mqts, || None);
        debug!(
            "msgq: setup mqas={} mqts={} msgqs={}",
            config.num_mqas, config.num_mqts, MAX_MSGQS
        );
        Ok(Self {
            engine,
            shared: Arc::new(MsgqShared::new(config.num_mqas)),
            transports: RwLock::new(transports),
            proc_mqt: RwLock::new([None; MAX_PROCESSORS]),
            located: Mutex::new([[Located::EMPTY; MAX_MSGQS]; MAX_PROCESSORS]),
        })
    }

    /// Close every transport, delete every queue and unbind every allocator
    pub fn destroy(&self) {
        let transports: Vec<_> = self.transports.write().iter_mut().filter_map(Option::take).collect();
        *self.proc_mqt.write() = [None; MAX_PROCESSORS];
        for transport in transports {
            if let Err(e) = transport.close() {
                warn!("msgq: destroy: {} transport close: {}", transport.name(), e);
            }
        }
        *self.located.lock() = [[Located::EMPTY; MAX_MSGQS]; MAX_PROCESSORS];

        let queues: Vec<_> = self.shared.queues.write().iter_mut().filter_map(Option::take).collect();
        for queue in queues {
            self.free_all(queue.shut());
        }
        *self.shared.error_handler.lock() = None;
        for slot in self.shared.allocators.write().iter_mut() {
            *slot = None;
        }
        debug!("msgq: destroyed");
    }

    pub fn num_mqas(&self) -> usize {
        self.shared.allocators.read().len()
    }

    pub fn num_mqts(&self) -> usize {
        self.transports.read().len()
    }

    pub fn shared(&self) -> &Arc<MsgqShared> {
        &self.shared
    }

    fn free_all(&self, messages: Vec<MsgqMsg>) {
        for msg in messages {
            if let Err(e) = self.shared.free(msg) {
                warn!("msgq: queued message not freed: {}", e);
            }
        }
    }

    // ========================================================================
    // Allocators
    // ========================================================================

    /// Bind an allocator to `mqa_id`
    pub fn allocator_open(&self, mqa_id: MqaId, allocator: Arc<dyn Allocator>) -> LinkResult<()> {
        let mut allocators = self.shared.allocators.write();
        let slot = allocators
            .get_mut(mqa_id.index())
            .ok_or(LinkError::InvalidArgument("allocator id"))?;
        if slot.is_some() {
            return Err(LinkError::AlreadyExists);
        }
        debug!("msgq: allocator {} ({}) open", mqa_id, allocator.name());
        *slot = Some(allocator);
        Ok(())
    }

    /// Unbind `mqa_id`, dropping the error handler if it allocates from it
    ///
    /// Lock order throughout: queues, allocators, error handler.
    pub fn allocator_close(&self, mqa_id: MqaId) -> LinkResult<()> {
        let mut allocators = self.shared.allocators.write();
        let slot = allocators
            .get_mut(mqa_id.index())
            .ok_or(LinkError::InvalidArgument("allocator id"))?;
        slot.take().ok_or(LinkError::NotFound)?;
        let mut handler = self.shared.error_handler.lock();
        if handler.is_some_and(|h| h.mqa_id == mqa_id) {
            *handler = None;
        }
        debug!("msgq: allocator {} closed", mqa_id);
        Ok(())
    }

    // ========================================================================
    // Transports
    // ========================================================================

    /// Open a transport and map its processor to it
    pub fn transport_open(&self, mqt_id: MqtId, attrs: &TransportAttrs) -> LinkResult<()> {
        if mqt_id.index() >= self.num_mqts() {
            return Err(LinkError::InvalidArgument("transport id"));
        }
        let proc_id = match attrs {
            TransportAttrs::Local => ID_GPP,
            TransportAttrs::Remote(remote) => {
                if remote.proc_id.index() >= self.engine.num_dsps() {
                    return Err(LinkError::InvalidArgument("processor id"));
                }
                remote.proc_id
            }
        };
        {
            // Claim the processor mapping before the open; it also reserves mqt_id
            let transports = self.transports.read();
            let mut proc_mqt = self.proc_mqt.write();
            if transports[mqt_id.index()].is_some()
                || proc_mqt[proc_id.index()].is_some()
                || proc_mqt.contains(&Some(mqt_id))
            {
                return Err(LinkError::AlreadyExists);
            }
            proc_mqt[proc_id.index()] = Some(mqt_id);
        }

        let opened: LinkResult<Arc<dyn Transport>> = match attrs {
            TransportAttrs::Local => Ok(Arc::new(LocalTransport::new(Arc::clone(&self.shared)))),
            TransportAttrs::Remote(remote) => {
                RemoteTransport::open(*remote, &self.engine, &self.shared)
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
            }
        };
        match opened {
            Ok(transport) => {
                debug!("msgq: transport {} ({}) serves {}", mqt_id, transport.name(), proc_id);
                self.transports.write()[mqt_id.index()] = Some(transport);
                Ok(())
            }
            Err(e) => {
                warn!("msgq: transport {} open failed: {}", mqt_id, e);
                self.proc_mqt.write()[proc_id.index()] = None;
                Err(e)
            }
        }
    }

    /// Close a transport and forget every locate made through it
    ///
    /// Returns the processor the transport served.
    pub fn transport_close(&self, mqt_id: MqtId) -> LinkResult<ProcessorId> {
        let transport = self
            .transports
            .write()
            .get_mut(mqt_id.index())
            .ok_or(LinkError::InvalidArgument("transport id"))?
            .take()
            .ok_or(LinkError::NotFound)?;
        let proc_id = transport.proc_id();
        self.proc_mqt.write()[proc_id.index()] = None;
        self.located.lock()[proc_id.index()] = [Located::EMPTY; MAX_MSGQS];
        debug!("msgq: transport {} closed", mqt_id);
        transport.close()?;
        Ok(proc_id)
    }

    fn transport_for(&self, proc_id: ProcessorId) -> LinkResult<Arc<dyn Transport>> {
        let mqt_id = self
            .proc_mqt
            .read()
            .get(proc_id.index())
            .copied()
            .ok_or(LinkError::InvalidArgument("processor id"))?
            .ok_or(LinkError::NotFound)?;
        self.transports.read()[mqt_id.index()]
            .clone()
            .ok_or(LinkError::NotFound)
    }

    // ========================================================================
    // Queues
    // ========================================================================

    /// Make `msgq_id` a receivable local queue
    pub fn create(&self, msgq_id: MsgqId) -> LinkResult<()> {
        let mut queues = self.shared.queues.write();
        let slot = queues
            .get_mut(msgq_id.index())
            .ok_or(LinkError::InvalidArgument("msgq id"))?;
        if slot.is_some() {
            return Err(LinkError::AlreadyExists);
        }
        *slot = Some(Arc::new(MsgqObject::new(msgq_id)));
        debug!("msgq: {} created", msgq_id);
        Ok(())
    }

    /// Remove a local queue, freeing anything still queued
    pub fn delete(&self, msgq_id: MsgqId) -> LinkResult<()> {
        let queue = self
            .shared
            .queues
            .write()
            .get_mut(msgq_id.index())
            .ok_or(LinkError::InvalidArgument("msgq id"))?
            .take()
            .ok_or(LinkError::NotFound)?;
        {
            let mut handler = self.shared.error_handler.lock();
            if handler.is_some_and(|h| h.msgq_id == msgq_id) {
                *handler = None;
            }
        }
        let drained = queue.shut();
        if !drained.is_empty() {
            debug!("msgq: {} deleted with {} message(s) queued", msgq_id, drained.len());
        }
        self.free_all(drained);
        Ok(())
    }

    /// Status of a queue id on a processor
    pub fn status(&self, proc_id: ProcessorId, msgq_id: MsgqId) -> LinkResult<MsgqStatus> {
        if msgq_id.index() >= MAX_MSGQS || proc_id.index() >= MAX_PROCESSORS {
            return Err(LinkError::InvalidArgument("msgq id"));
        }
        if proc_id == ID_GPP && self.shared.is_local_queue(msgq_id) {
            return Ok(MsgqStatus::InUse);
        }
        Ok(self.located.lock()[proc_id.index()][msgq_id.index()].status)
    }

    /// Find a queue on `proc_id`
    ///
    /// `NotFound` is retried with growing pauses until `attrs.timeout`
    /// expires; the last attempt's status is returned then. Each attempt
    /// is handed the time left, so the call never outlasts the timeout.
    pub fn locate(&self, proc_id: ProcessorId, msgq_id: MsgqId, attrs: &MsgqLocateAttrs) -> LinkResult<()> {
        if msgq_id.index() >= MAX_MSGQS {
            return Err(LinkError::InvalidArgument("msgq id"));
        }
        let transport = self.transport_for(proc_id)?;
        self.mark_locating(proc_id, msgq_id);

        let deadline = Deadline::new(attrs.timeout);
        let mut backoff = LOCATE_BACKOFF_START_MS;
        let result = loop {
            match transport.locate(msgq_id, deadline.remaining()) {
                Err(e) if e.is_retryable() => {
                    let pause = Duration::from_millis(backoff);
                    match deadline.remaining() {
                        Timeout::NoWait => break Err(e),
                        Timeout::Millis(ms) => {
                            std::thread::sleep(pause.min(Duration::from_millis(u64::from(ms))))
                        }
                        Timeout::Forever => std::thread::sleep(pause),
                    }
                    backoff = (backoff * 2).min(LOCATE_BACKOFF_MAX_MS);
                    trace!("msgq: locate {} on {} retrying", msgq_id, proc_id);
                }
                other => break other,
            }
        };

        let mut located = self.located.lock();
        let entry = &mut located[proc_id.index()][msgq_id.index()];
        match result {
            Ok(()) => {
                entry.count += 1;
                entry.status = MsgqStatus::InUse;
                debug!("msgq: located {} on {}", msgq_id, proc_id);
            }
            Err(_) if entry.count == 0 => entry.status = MsgqStatus::Empty,
            Err(_) => entry.status = MsgqStatus::InUse,
        }
        result
    }

    fn mark_locating(&self, proc_id: ProcessorId, msgq_id: MsgqId) {
        let mut located = self.located.lock();
        let entry = &mut located[proc_id.index()][msgq_id.index()];
        if entry.count == 0 {
            entry.status = MsgqStatus::LocatePending;
        }
    }

    /// Undo one successful locate
    pub fn release(&self, proc_id: ProcessorId, msgq_id: MsgqId) -> LinkResult<()> {
        if msgq_id.index() >= MAX_MSGQS || proc_id.index() >= MAX_PROCESSORS {
            return Err(LinkError::InvalidArgument("msgq id"));
        }
        let last = {
            let mut located = self.located.lock();
            let entry = &mut located[proc_id.index()][msgq_id.index()];
            if entry.count == 0 {
                return Err(LinkError::NotFound);
            }
            entry.count -= 1;
            if entry.count == 0 {
                entry.status = MsgqStatus::Empty;
            }
            entry.count == 0
        };
        if last {
            if let Ok(transport) = self.transport_for(proc_id) {
                transport.release(msgq_id)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Allocate a message of `size` bytes (header included) from `mqa_id`
    pub fn alloc(&self, mqa_id: MqaId, size: usize) -> LinkResult<MsgqMsg> {
        self.shared.alloc(mqa_id, size)
    }

    pub fn free(&self, msg: MsgqMsg) -> LinkResult<()> {
        self.shared.free(msg)
    }

    /// Stamp and send a message to `dst` on `proc_id`
    ///
    /// Remote destinations must have been located. On failure the message
    /// is handed back.
    pub fn put(
        &self,
        proc_id: ProcessorId,
        dst: MsgqId,
        mut msg: MsgqMsg,
        msg_id: u16,
        src: MsgqId,
    ) -> Result<(), (LinkError, MsgqMsg)> {
        if dst.index() >= MAX_MSGQS {
            return Err((LinkError::InvalidArgument("msgq id"), msg));
        }
        let transport = match self.transport_for(proc_id) {
            Ok(transport) => transport,
            Err(e) => return Err((e, msg)),
        };
        if proc_id != ID_GPP && self.located.lock()[proc_id.index()][dst.index()].count == 0 {
            return Err((LinkError::NotFound, msg));
        }
        let header = msg.header_mut();
        header.dst_msgq = dst;
        header.msg_id = msg_id;
        header.src_msgq = src;
        header.src_proc = ID_GPP;
        trace!("msgq: put id={:#x} to {}/{}", msg_id, proc_id, dst);
        transport.put(msg)
    }

    /// Receive from a local queue
    pub fn get(&self, msgq_id: MsgqId, timeout: Timeout) -> LinkResult<MsgqMsg> {
        let queue = self
            .shared
            .queue(msgq_id)
            .ok_or(LinkError::InvalidArgument("msgq not created"))?;
        queue.get(timeout)
    }

    /// Reply address embedded in a received message
    pub fn get_reply_id(&self, msg: &MsgqMsg) -> LinkResult<(ProcessorId, MsgqId)> {
        let header = msg.header();
        if !header.src_msgq.is_valid() {
            return Err(LinkError::NotFound);
        }
        Ok((header.src_proc, header.src_msgq))
    }

    /// Messages waiting on a local queue
    pub fn count(&self, msgq_id: MsgqId) -> LinkResult<usize> {
        self.shared
            .queue(msgq_id)
            .map(|q| q.count())
            .ok_or(LinkError::InvalidArgument("msgq not created"))
    }

    // ========================================================================
    // Error Handler
    // ========================================================================

    /// Route asynchronous errors to `msgq_id`, or stop with `MsgqId::INVALID`
    pub fn set_error_handler(&self, msgq_id: MsgqId, mqa_id: MqaId) -> LinkResult<()> {
        if !msgq_id.is_valid() {
            *self.shared.error_handler.lock() = None;
            return Ok(());
        }
        // Hold the tables while installing so neither entry can vanish in between
        let queues = self.shared.queues.read();
        let allocators = self.shared.allocators.read();
        if !queues.get(msgq_id.index()).is_some_and(Option::is_some) {
            return Err(LinkError::InvalidArgument("msgq not created"));
        }
        if !allocators.get(mqa_id.index()).is_some_and(Option::is_some) {
            return Err(LinkError::InvalidArgument("allocator id"));
        }
        *self.shared.error_handler.lock() = Some(ErrorHandler { msgq_id, mqa_id });
        debug!("msgq: error handler is {} ({})", msgq_id, mqa_id);
        Ok(())
    }

    pub fn send_error_msg(&self, error: &MsgqAsyncError) -> LinkResult<()> {
        self.shared.send_error_msg(error)
    }
}

impl core::fmt::Debug for LdrvMsgq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LdrvMsgq")
            .field("num_mqas", &self.num_mqas())
            .field("num_mqts", &self.num_mqts())
            .field("proc_mqt", &*self.proc_mqt.read())
            .finish()
    }
}
