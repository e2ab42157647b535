//! Remote Transport - Messages framed over the DSP message channels
//!
//! Opening the transport claims the two reserved channels of one DSP:
//! `ID_MSGCHNL_TO_DSP` (output) and `ID_MSGCHNL_FM_DSP` (input). Every
//! receive buffer is queued up front and a dispatcher thread turns each
//! completed receive into either a locate acknowledgement or a message
//! delivered to a local queue, then queues the buffer again.
//!
//! Transmit buffers come from a fixed set. Completed sends are reclaimed
//! lazily, at the start of the next send.
//!
//! ## Locate protocol
//!
//! ```text
//!   GPP                                   DSP
//!    |-- LOCATE     {dst=q, seq=n} ------->|
//!    |<- LOCATE_ACK {dst=q, seq=n, found} -|
//! ```
//!
//! The sequence number pairs each ack with the attempt that asked.
//! An attempt waits for its ack no longer than the caller's timeout and
//! never more than `ACK_WAIT_MS`.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, trace, warn};
use spin::Mutex;

use super::{RemoteAttrs, Transport};
use crate::chnl::{ChannelAttrs, ChannelEngine, IoInfo};
use crate::error::{LinkError, LinkResult};
use crate::msgq::ldrv::MsgqShared;
use crate::msgq::msg::{
    LocateFrame, MsgHeader, MsgqAsyncError, MsgqErrorKind, MsgqMsg, MSGQ_LOCATE_ACK_MSGID,
    MSGQ_LOCATE_MSGID, MSG_HEADER_SIZE,
};
use crate::osal::{Deadline, SyncEvent, Teardown};
use crate::types::{
    MsgqId, ProcessorId, Timeout, ID_GPP, ID_MSGCHNL_FM_DSP, ID_MSGCHNL_TO_DSP,
};

/// How long one locate attempt waits for its acknowledgement
const ACK_WAIT_MS: u32 = 500;

/// How long a send waits for a transmit buffer to come back
const TX_WAIT_MS: u32 = 1000;

/// `timeout`, bounded to at most `cap_ms`
fn capped(timeout: Timeout, cap_ms: u32) -> Timeout {
    match timeout {
        Timeout::NoWait => Timeout::NoWait,
        Timeout::Forever => Timeout::Millis(cap_ms),
        Timeout::Millis(ms) => Timeout::Millis(ms.min(cap_ms)),
    }
}

// ============================================================================
// Locate Waiters
// ============================================================================

const OUTCOME_PENDING: u8 = 0;
const OUTCOME_FOUND: u8 = 1;
const OUTCOME_ABSENT: u8 = 2;
const OUTCOME_CLOSED: u8 = 3;

struct LocateWaiter {
    seq: u32,
    msgq_id: MsgqId,
    outcome: AtomicU8,
    event: SyncEvent,
}

impl LocateWaiter {
    fn new(seq: u32, msgq_id: MsgqId) -> Self {
        Self {
            seq,
            msgq_id,
            outcome: AtomicU8::new(OUTCOME_PENDING),
            event: SyncEvent::new(),
        }
    }

    fn finish(&self, outcome: u8) {
        self.outcome.store(outcome, Ordering::Release);
        self.event.signal();
    }

    fn result(&self) -> LinkResult<()> {
        match self.outcome.load(Ordering::Acquire) {
            OUTCOME_FOUND => Ok(()),
            OUTCOME_ABSENT => Err(LinkError::NotFound),
            OUTCOME_CLOSED => Err(LinkError::GeneralFailure("transport closed")),
            _ => Err(LinkError::Timeout),
        }
    }
}

// ============================================================================
// Transport State
// ============================================================================

struct RemoteInner {
    attrs: RemoteAttrs,
    engine: Arc<ChannelEngine>,
    shared: Arc<MsgqShared>,
    tx_free: Mutex<Vec<Vec<u8>>>,
    waiters: Mutex<Vec<Arc<LocateWaiter>>>,
    next_seq: AtomicU32,
    closing: AtomicBool,
}

fn frame_buffer(size: usize) -> LinkResult<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| LinkError::OutOfMemory)?;
    buffer.resize(size, 0);
    Ok(buffer)
}

impl RemoteInner {
    fn proc_id(&self) -> ProcessorId {
        self.attrs.proc_id
    }

    fn check_open(&self) -> LinkResult<()> {
        if self.closing.load(Ordering::Acquire) {
            Err(LinkError::GeneralFailure("transport closed"))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Transmit
    // ========================================================================

    fn reclaim_tx(&self) {
        while let Ok(info) = self
            .engine
            .get_io_completion(self.proc_id(), ID_MSGCHNL_TO_DSP, Timeout::NoWait)
        {
            self.tx_free.lock().push(info.buffer);
        }
    }

    fn take_tx_buffer(&self, wait: Timeout) -> LinkResult<Vec<u8>> {
        self.reclaim_tx();
        if let Some(buffer) = self.tx_free.lock().pop() {
            return Ok(buffer);
        }
        match self.engine.get_io_completion(self.proc_id(), ID_MSGCHNL_TO_DSP, wait) {
            Ok(info) => Ok(info.buffer),
            Err(LinkError::NoIoCompletion) => Err(LinkError::Timeout),
            Err(e) => Err(e),
        }
    }

    /// Fill a transmit buffer with `fill` and queue it
    ///
    /// Waits up to `wait` for a transmit buffer when all are in flight.
    fn send_frame(
        &self,
        wait: Timeout,
        fill: impl FnOnce(&mut Vec<u8>) -> LinkResult<()>,
    ) -> LinkResult<()> {
        self.check_open()?;
        let mut buffer = self.take_tx_buffer(wait)?;
        if let Err(e) = fill(&mut buffer) {
            self.tx_free.lock().push(buffer);
            return Err(e);
        }
        let size = buffer.len();
        if size > self.attrs.max_msg_size {
            self.tx_free.lock().push(buffer);
            return Err(LinkError::InvalidArgument("message too large"));
        }
        self.engine
            .add_io_request(self.proc_id(), ID_MSGCHNL_TO_DSP, IoInfo::new(buffer, size))
            .map_err(|(e, info)| {
                self.tx_free.lock().push(info.buffer);
                e
            })
    }

    // ========================================================================
    // Receive
    // ========================================================================

    fn receive_loop(&self) {
        let proc_id = self.proc_id();
        loop {
            let info = match self
                .engine
                .get_io_completion(proc_id, ID_MSGCHNL_FM_DSP, Timeout::Forever)
            {
                Ok(info) => info,
                Err(e) => {
                    debug!("mqt remote: {} receiver stopped: {}", proc_id, e);
                    return;
                }
            };
            if self.closing.load(Ordering::Acquire) {
                return;
            }
            if !info.status.is_canceled() {
                if let Err(e) = self.dispatch(info.data()) {
                    warn!("mqt remote: frame from {} dropped: {}", proc_id, e);
                }
            }
            let size = info.buffer.len();
            if let Err((e, _)) =
                self.engine
                    .add_io_request(proc_id, ID_MSGCHNL_FM_DSP, IoInfo::new(info.buffer, size))
            {
                debug!("mqt remote: {} receive buffer not requeued: {}", proc_id, e);
                return;
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) -> LinkResult<()> {
        let endianism = self.attrs.endianism;
        let header = MsgHeader::decode(endianism, frame)?;
        match header.msg_id {
            MSGQ_LOCATE_ACK_MSGID => {
                let ack = LocateFrame::decode(&header, endianism, frame)?;
                self.complete_locate(&ack);
                Ok(())
            }
            MSGQ_LOCATE_MSGID => {
                let request = LocateFrame::decode(&header, endianism, frame)?;
                let ack = LocateFrame {
                    proc_id: ID_GPP,
                    msgq_id: request.msgq_id,
                    seq: request.seq,
                    found: self.shared.is_local_queue(request.msgq_id),
                };
                self.send_frame(Timeout::Millis(TX_WAIT_MS), |out| {
                    ack.encode(MSGQ_LOCATE_ACK_MSGID, endianism, out)
                })
            }
            _ if header.is_internal() => Err(LinkError::InvalidArgument("reserved message id")),
            _ => self.receive_message(&header, frame),
        }
    }

    fn complete_locate(&self, ack: &LocateFrame) {
        let waiters = self.waiters.lock();
        match waiters
            .iter()
            .find(|w| w.seq == ack.seq && w.msgq_id == ack.msgq_id)
        {
            Some(waiter) => waiter.finish(if ack.found { OUTCOME_FOUND } else { OUTCOME_ABSENT }),
            None => trace!("mqt remote: stale locate ack seq={}", ack.seq),
        }
    }

    fn receive_message(&self, header: &MsgHeader, frame: &[u8]) -> LinkResult<()> {
        let size = header.size as usize;
        let mqa_id = if self.shared.has_allocator(header.mqa_id) {
            header.mqa_id
        } else {
            self.attrs.default_mqa
        };
        let mut msg = match self.shared.alloc(mqa_id, size) {
            Ok(msg) => msg,
            Err(e) => {
                self.report(MsgqErrorKind::AllocatorFailure, header.dst_msgq);
                return Err(e);
            }
        };
        msg.body_mut().copy_from_slice(&frame[MSG_HEADER_SIZE..size]);
        *msg.header_mut() = MsgHeader { mqa_id, ..*header };

        if let Err((e, msg)) = self.shared.deliver(msg) {
            if let Err(free_err) = self.shared.free(msg) {
                warn!("mqt remote: undeliverable message not freed: {}", free_err);
            }
            self.report(MsgqErrorKind::UnknownQueue, header.dst_msgq);
            return Err(e);
        }
        Ok(())
    }

    fn report(&self, kind: MsgqErrorKind, msgq_id: MsgqId) {
        let error = MsgqAsyncError {
            kind,
            arg1: u32::from(self.proc_id().0),
            arg2: u32::from(msgq_id.0),
        };
        if let Err(e) = self.shared.send_error_msg(&error) {
            trace!("mqt remote: {:?} not reported: {}", kind, e);
        }
    }
}

// ============================================================================
// Remote Transport
// ============================================================================

/// Transport for queues living on a DSP
pub struct RemoteTransport {
    inner: Arc<RemoteInner>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteTransport {
    /// Claim the message channels of `attrs.proc_id` and start receiving
    ///
    /// Every step already taken is undone if a later one fails.
    pub fn open(
        attrs: RemoteAttrs,
        engine: &Arc<ChannelEngine>,
        shared: &Arc<MsgqShared>,
    ) -> LinkResult<Self> {
        let proc_id = attrs.proc_id;
        if !proc_id.is_dsp() {
            return Err(LinkError::InvalidArgument("processor id"));
        }
        if attrs.max_msg_size < MSG_HEADER_SIZE + LocateFrame::BODY_SIZE
            || attrs.max_msg_size > usize::from(u16::MAX)
        {
            return Err(LinkError::InvalidArgument("max_msg_size"));
        }

        let mut teardown = Teardown::new("remote transport open");
        engine.open(
            proc_id,
            ID_MSGCHNL_TO_DSP,
            &ChannelAttrs::output(attrs.num_bufs).with_endianism(attrs.endianism),
        )?;
        teardown.push("close to-dsp channel", || {
            let _ = engine.close(proc_id, ID_MSGCHNL_TO_DSP);
        });
        engine.open(
            proc_id,
            ID_MSGCHNL_FM_DSP,
            &ChannelAttrs::input(attrs.num_bufs).with_endianism(attrs.endianism),
        )?;
        teardown.push("close fm-dsp channel", || {
            let _ = engine.close(proc_id, ID_MSGCHNL_FM_DSP);
        });

        let mut tx_free = Vec::with_capacity(attrs.num_bufs);
        for _ in 0..attrs.num_bufs {
            tx_free.push(frame_buffer(attrs.max_msg_size)?);
            let rx = frame_buffer(attrs.max_msg_size)?;
            engine
                .add_io_request(proc_id, ID_MSGCHNL_FM_DSP, IoInfo::new(rx, attrs.max_msg_size))
                .map_err(|(e, _)| e)?;
        }

        let inner = Arc::new(RemoteInner {
            attrs,
            engine: Arc::clone(engine),
            shared: Arc::clone(shared),
            tx_free: Mutex::new(tx_free),
            waiters: Mutex::new(Vec::new()),
            next_seq: AtomicU32::new(1),
            closing: AtomicBool::new(false),
        });
        let receiver = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("msgq-rx-{}", proc_id))
            .spawn(move || receiver.receive_loop())
            .map_err(|_| LinkError::GeneralFailure("receiver thread"))?;

        teardown.commit();
        debug!(
            "mqt remote: open to {} bufs={} max_msg={}",
            proc_id, attrs.num_bufs, attrs.max_msg_size
        );
        Ok(Self {
            inner,
            rx_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn attrs(&self) -> &RemoteAttrs {
        &self.inner.attrs
    }
}

impl Transport for RemoteTransport {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn proc_id(&self) -> ProcessorId {
        self.inner.proc_id()
    }

    fn locate(&self, msgq_id: MsgqId, timeout: Timeout) -> LinkResult<()> {
        let inner = &self.inner;
        inner.check_open()?;
        let deadline = Deadline::new(timeout);
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let waiter = Arc::new(LocateWaiter::new(seq, msgq_id));
        inner.waiters.lock().push(Arc::clone(&waiter));

        let request = LocateFrame {
            proc_id: ID_GPP,
            msgq_id,
            seq,
            found: false,
        };
        let endianism = inner.attrs.endianism;
        let sent = inner.send_frame(capped(timeout, TX_WAIT_MS), |out| {
            request.encode(MSGQ_LOCATE_MSGID, endianism, out)
        });
        let result = match sent {
            Ok(()) => {
                waiter.event.wait(capped(deadline.remaining(), ACK_WAIT_MS));
                waiter.result()
            }
            Err(e) => Err(e),
        };
        inner.waiters.lock().retain(|w| !Arc::ptr_eq(w, &waiter));
        trace!("mqt remote: locate {} on {} seq={} -> {:?}", msgq_id, self.proc_id(), seq, result);
        result
    }

    fn put(&self, msg: MsgqMsg) -> Result<(), (LinkError, MsgqMsg)> {
        let inner = &self.inner;
        if msg.size() > inner.attrs.max_msg_size {
            return Err((LinkError::InvalidArgument("message too large"), msg));
        }
        let endianism = inner.attrs.endianism;
        if let Err(e) = inner.send_frame(Timeout::Millis(TX_WAIT_MS), |out| msg.encode_frame(endianism, out)) {
            return Err((e, msg));
        }
        if let Err(e) = inner.shared.free(msg) {
            warn!("mqt remote: sent message not freed: {}", e);
        }
        Ok(())
    }

    fn close(&self) -> LinkResult<()> {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for waiter in inner.waiters.lock().iter() {
            waiter.finish(OUTCOME_CLOSED);
        }

        let proc_id = inner.proc_id();
        if let Err(e) = inner.engine.close(proc_id, ID_MSGCHNL_FM_DSP) {
            warn!("mqt remote: closing fm-dsp on {}: {}", proc_id, e);
        }
        let handle = self.rx_thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("mqt remote: receiver thread for {} panicked", proc_id);
            }
        }
        if let Err(e) = inner.engine.close(proc_id, ID_MSGCHNL_TO_DSP) {
            warn!("mqt remote: closing to-dsp on {}: {}", proc_id, e);
        }
        debug!("mqt remote: closed transport to {}", proc_id);
        Ok(())
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl core::fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("attrs", &self.inner.attrs)
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .finish()
    }
}
