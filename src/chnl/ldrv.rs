//! Channel Engine - Per-channel chirp queueing
//!
//! Each (processor, channel) pair owns one [`ChannelObject`]: a fixed chirp
//! pool, a state machine, a sync event signalled while completions are
//! waiting, and an idle-sync event signalled while no request is pending.
//!
//! ## Locking
//!
//! The chirp lists of a channel sit behind one spin lock, held only for
//! list manipulation. The completion path takes the same lock briefly and
//! never blocks, so it is safe from a driver's interrupt-like thread.
//! Blocking callers release the lock before parking on an event.
//!
//! ## State machine
//!
//! ```text
//!   open --> Idled --issue--> Ready --idle--> Idled
//!                               |
//!                          EOS completion --> EndOfStream --idle--> Idled
//!   close (any state) --> Closed
//! ```
//!
//! The engine trusts its caller: ownership is enforced one layer up in
//! [`crate::chnl::pmgr`].

use std::sync::Arc;

use log::{debug, trace, warn};
use spin::{Mutex, RwLock};

use super::chirp::{ChirpHandle, ChirpPool, ChirpStatus, Chirp, IoInfo};
use crate::drv::LinkDriver;
use crate::error::{LinkError, LinkResult};
use crate::osal::{Deadline, SyncEvent, WaitResult};
use crate::types::{ChannelId, ProcessorId, Timeout, MAX_CHANNEL_IDS, MAX_DSPS};

// ============================================================================
// Channel Attributes
// ============================================================================

/// Direction of data flow, seen from the GPP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// DSP to GPP
    Input,
    /// GPP to DSP
    Output,
}

/// Byte order of data on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianism {
    /// Whatever the link was configured with (little endian on host)
    #[default]
    Default,
    Little,
    Big,
}

/// Word size of the DSP side of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSize {
    Bits8,
    #[default]
    Bits16,
    Bits32,
}

/// Attributes a channel is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAttrs {
    pub mode: ChannelMode,
    pub endianism: Endianism,
    pub size: DataSize,
    /// Maximum number of buffers queued at once (chirp pool capacity)
    pub num_bufs: usize,
}

impl ChannelAttrs {
    pub fn new(mode: ChannelMode, num_bufs: usize) -> Self {
        Self {
            mode,
            endianism: Endianism::Default,
            size: DataSize::default(),
            num_bufs,
        }
    }

    pub fn input(num_bufs: usize) -> Self {
        Self::new(ChannelMode::Input, num_bufs)
    }

    pub fn output(num_bufs: usize) -> Self {
        Self::new(ChannelMode::Output, num_bufs)
    }

    pub fn with_endianism(mut self, endianism: Endianism) -> Self {
        self.endianism = endianism;
        self
    }

    pub fn with_size(mut self, size: DataSize) -> Self {
        self.size = size;
        self
    }
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Requests are queued or may be queued
    Ready,
    /// Nothing in flight; set on open and after idle
    Idled,
    /// An EOS completion arrived; no new requests until idled
    EndOfStream,
    /// Terminal
    Closed,
}

/// List sizes of a channel's chirp pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChirpCounts {
    pub capacity: usize,
    pub free: usize,
    pub requested: usize,
    pub completed: usize,
}

impl ChirpCounts {
    pub fn is_conserved(&self) -> bool {
        self.free + self.requested + self.completed == self.capacity
    }
}

// ============================================================================
// Channel Object
// ============================================================================

struct ChannelQueues {
    state: ChannelState,
    pool: ChirpPool,
}

/// One open channel
pub struct ChannelObject {
    proc_id: ProcessorId,
    chnl_id: ChannelId,
    attrs: ChannelAttrs,
    queues: Mutex<ChannelQueues>,
    /// Signalled while the completed list is non-empty
    sync_event: SyncEvent,
    /// Signalled while the requested list is empty
    idle_sync: SyncEvent,
}

impl ChannelObject {
    fn new(proc_id: ProcessorId, chnl_id: ChannelId, attrs: ChannelAttrs) -> Self {
        let idle_sync = SyncEvent::new();
        idle_sync.signal();
        Self {
            proc_id,
            chnl_id,
            attrs,
            queues: Mutex::new(ChannelQueues {
                state: ChannelState::Idled,
                pool: ChirpPool::new(attrs.num_bufs),
            }),
            sync_event: SyncEvent::new(),
            idle_sync,
        }
    }

    pub fn attrs(&self) -> &ChannelAttrs {
        &self.attrs
    }

    fn counts(&self) -> ChirpCounts {
        let queues = self.queues.lock();
        ChirpCounts {
            capacity: queues.pool.capacity(),
            free: queues.pool.free_count(),
            requested: queues.pool.requested_count(),
            completed: queues.pool.completed_count(),
        }
    }
}

impl core::fmt::Debug for ChannelObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelObject")
            .field("proc_id", &self.proc_id)
            .field("chnl_id", &self.chnl_id)
            .field("attrs", &self.attrs)
            .field("counts", &self.counts())
            .finish()
    }
}

type ChannelTable = Vec<Option<Arc<ChannelObject>>>;

// ============================================================================
// Channel Engine
// ============================================================================

/// Channel objects of every initialized processor
pub struct ChannelEngine {
    num_dsps: usize,
    max_bufs: usize,
    driver: Arc<dyn LinkDriver>,
    procs: Vec<RwLock<Option<ChannelTable>>>,
}

impl ChannelEngine {
    pub fn new(num_dsps: usize, max_bufs: usize, driver: Arc<dyn LinkDriver>) -> Self {
        let num_dsps = num_dsps.min(MAX_DSPS);
        let mut procs = Vec::with_capacity(num_dsps);
        procs.resize_with(num_dsps, || RwLock::new(None));
        Self {
            num_dsps,
            max_bufs,
            driver,
            procs,
        }
    }

    pub fn driver(&self) -> &Arc<dyn LinkDriver> {
        &self.driver
    }

    pub fn num_dsps(&self) -> usize {
        self.num_dsps
    }

    fn proc_table(&self, proc_id: ProcessorId) -> LinkResult<&RwLock<Option<ChannelTable>>> {
        self.procs
            .get(proc_id.index())
            .ok_or(LinkError::InvalidArgument("processor id"))
    }

    fn object(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<Arc<ChannelObject>> {
        if chnl_id.index() >= MAX_CHANNEL_IDS {
            return Err(LinkError::InvalidArgument("channel id"));
        }
        let table = self.proc_table(proc_id)?.read();
        let table = table
            .as_ref()
            .ok_or(LinkError::GeneralFailure("processor not initialized"))?;
        table[chnl_id.index()]
            .clone()
            .ok_or(LinkError::InvalidArgument("channel not open"))
    }

    // ========================================================================
    // Processor Lifecycle
    // ========================================================================

    /// Allocate the channel-object table of a processor
    pub fn initialize(&self, proc_id: ProcessorId) -> LinkResult<()> {
        let mut slot = self.proc_table(proc_id)?.write();
        if slot.is_some() {
            return Err(LinkError::GeneralFailure("processor already initialized"));
        }
        let mut table: ChannelTable = Vec::new();
        table
            .try_reserve_exact(MAX_CHANNEL_IDS)
            .map_err(|_| LinkError::OutOfMemory)?;
        table.resize_with(MAX_CHANNEL_IDS, || None);
        *slot = Some(table);
        debug!("chnl: {} initialized ({} channel ids)", proc_id, MAX_CHANNEL_IDS);
        Ok(())
    }

    /// Close every channel of a processor and release its table
    pub fn finalize(&self, proc_id: ProcessorId) -> LinkResult<()> {
        let table = self
            .proc_table(proc_id)?
            .write()
            .take()
            .ok_or(LinkError::GeneralFailure("processor not initialized"))?;
        for object in table.into_iter().flatten() {
            warn!("chnl: {}/{} still open at finalize", proc_id, object.chnl_id);
            Self::shut(&object);
            self.driver.channel_closed(proc_id, object.chnl_id);
        }
        debug!("chnl: {} finalized", proc_id);
        Ok(())
    }

    pub fn is_initialized(&self, proc_id: ProcessorId) -> bool {
        self.proc_table(proc_id)
            .map(|table| table.read().is_some())
            .unwrap_or(false)
    }

    // ========================================================================
    // Channel Lifecycle
    // ========================================================================

    /// Open a channel and allocate its chirp pool
    pub fn open(&self, proc_id: ProcessorId, chnl_id: ChannelId, attrs: &ChannelAttrs) -> LinkResult<()> {
        if chnl_id.index() >= MAX_CHANNEL_IDS {
            return Err(LinkError::InvalidArgument("channel id"));
        }
        if attrs.num_bufs == 0 || attrs.num_bufs > self.max_bufs {
            return Err(LinkError::InvalidArgument("num_bufs"));
        }
        {
            let mut table = self.proc_table(proc_id)?.write();
            let table = table
                .as_mut()
                .ok_or(LinkError::GeneralFailure("processor not initialized"))?;
            let slot = &mut table[chnl_id.index()];
            if slot.is_some() {
                return Err(LinkError::InvalidArgument("channel already open"));
            }
            *slot = Some(Arc::new(ChannelObject::new(proc_id, chnl_id, *attrs)));
        }
        self.driver.channel_opened(proc_id, chnl_id, attrs);
        debug!(
            "chnl: open {}/{} {:?} bufs={}",
            proc_id, chnl_id, attrs.mode, attrs.num_bufs
        );
        Ok(())
    }

    /// Close a channel
    ///
    /// Wakes every blocked caller and hands back buffers still queued.
    pub fn close(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<Vec<IoInfo>> {
        if chnl_id.index() >= MAX_CHANNEL_IDS {
            return Err(LinkError::InvalidArgument("channel id"));
        }
        let object = {
            let mut table = self.proc_table(proc_id)?.write();
            let table = table
                .as_mut()
                .ok_or(LinkError::GeneralFailure("processor not initialized"))?;
            table[chnl_id.index()]
                .take()
                .ok_or(LinkError::InvalidArgument("channel not open"))?
        };
        let drained = Self::shut(&object);
        self.driver.channel_closed(proc_id, chnl_id);
        debug!("chnl: close {}/{} ({} buffer(s) returned)", proc_id, chnl_id, drained.len());
        Ok(drained)
    }

    fn shut(object: &ChannelObject) -> Vec<IoInfo> {
        let drained = {
            let mut queues = object.queues.lock();
            queues.state = ChannelState::Closed;
            queues.pool.drain()
        };
        object.sync_event.signal();
        object.idle_sync.signal();
        drained
    }

    pub fn is_open(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> bool {
        self.object(proc_id, chnl_id).is_ok()
    }

    // ========================================================================
    // I/O Path
    // ========================================================================

    /// Queue a buffer on a channel
    ///
    /// Output channels send the buffer; input channels offer it as a
    /// receive slot. On failure the descriptor is handed back, including
    /// when the driver refuses a request it has not completed.
    pub fn add_io_request(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        info: IoInfo,
    ) -> Result<(), (LinkError, IoInfo)> {
        let object = match self.object(proc_id, chnl_id) {
            Ok(object) => object,
            Err(e) => return Err((e, info)),
        };
        if info.size > info.buffer.len() {
            return Err((LinkError::InvalidArgument("size exceeds buffer"), info));
        }
        let handle = {
            let mut queues = object.queues.lock();
            match queues.state {
                ChannelState::Closed => {
                    return Err((LinkError::GeneralFailure("channel closed"), info));
                }
                ChannelState::EndOfStream => return Err((LinkError::EndOfStream, info)),
                ChannelState::Ready | ChannelState::Idled => {}
            }
            let handle = match queues.pool.request(info) {
                Ok(handle) => handle,
                Err(info) => return Err((LinkError::OutOfMemory, info)),
            };
            queues.state = ChannelState::Ready;
            object.idle_sync.reset();
            handle
        };
        trace!("chnl: request queued on {}/{}", proc_id, chnl_id);

        let Err(e) = self.driver.io_request(self, proc_id, chnl_id) else {
            return Ok(());
        };
        let mut queues = object.queues.lock();
        match queues.pool.withdraw(handle) {
            Some(info) => {
                if queues.pool.requested_count() == 0 {
                    object.idle_sync.signal();
                }
                debug!(
                    "chnl: {} driver rejected request on {}/{}: {}",
                    self.driver.name(),
                    proc_id,
                    chnl_id,
                    e
                );
                Err((e, info))
            }
            None => {
                // already completed; the caller reclaims it as usual
                warn!(
                    "chnl: {} driver failed after completing on {}/{}: {}",
                    self.driver.name(),
                    proc_id,
                    chnl_id,
                    e
                );
                Ok(())
            }
        }
    }

    /// Report completion of a pending chirp
    ///
    /// Never blocks: safe from the driver's completion context.
    pub fn add_io_completion(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        chirp: ChirpHandle,
        status: ChirpStatus,
    ) -> LinkResult<()> {
        let object = self.object(proc_id, chnl_id)?;
        let completed = {
            let mut queues = object.queues.lock();
            let completed = queues
                .pool
                .complete(chirp, status)
                .ok_or(LinkError::InvalidArgument("chirp not pending"))?;
            if status.is_eos() {
                queues.state = ChannelState::EndOfStream;
            }
            object.sync_event.signal();
            if queues.pool.requested_count() == 0 {
                object.idle_sync.signal();
            }
            completed
        };
        trace!("chnl: completion on {}/{} status={:#x}", proc_id, chnl_id, status.bits());

        if let Some(callback) = completed.callback {
            callback(proc_id, chnl_id, completed.arg, completed.status);
        }
        Ok(())
    }

    /// Retrieve the oldest completed buffer
    ///
    /// `NoWait` returns `NoIoCompletion` at once when nothing is
    /// completed; a bounded wait that expires returns `Timeout`.
    pub fn get_io_completion(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        timeout: Timeout,
    ) -> LinkResult<IoInfo> {
        let object = self.object(proc_id, chnl_id)?;
        let deadline = Deadline::new(timeout);
        loop {
            {
                let mut queues = object.queues.lock();
                if let Some(info) = queues.pool.reclaim() {
                    if queues.pool.completed_count() == 0 {
                        object.sync_event.reset();
                    }
                    return Ok(info);
                }
                if queues.state == ChannelState::Closed {
                    return Err(LinkError::GeneralFailure("channel closed"));
                }
            }
            if timeout.is_no_wait() {
                return Err(LinkError::NoIoCompletion);
            }
            if deadline.expired() {
                return Err(LinkError::Timeout);
            }
            if object.sync_event.wait_until(deadline) == WaitResult::TimedOut && deadline.expired() {
                // Take whatever raced in before giving up
                let mut queues = object.queues.lock();
                return match queues.pool.reclaim() {
                    Some(info) => {
                        if queues.pool.completed_count() == 0 {
                            object.sync_event.reset();
                        }
                        Ok(info)
                    }
                    None => Err(LinkError::Timeout),
                };
            }
        }
    }

    /// Drain pending requests
    ///
    /// Input channels discard every pending request at once regardless of
    /// `flush`. Output channels with `flush` block until every pending
    /// request completes; without `flush` they discard at once. Discarded
    /// buffers are handed back with status `CANCELED`.
    pub fn idle(&self, proc_id: ProcessorId, chnl_id: ChannelId, flush: bool) -> LinkResult<Vec<IoInfo>> {
        let object = self.object(proc_id, chnl_id)?;

        if object.attrs.mode == ChannelMode::Input || !flush {
            let discarded = {
                let mut queues = object.queues.lock();
                if queues.state == ChannelState::Closed {
                    return Err(LinkError::GeneralFailure("channel closed"));
                }
                let discarded = queues.pool.discard_requests();
                queues.state = ChannelState::Idled;
                object.idle_sync.signal();
                discarded
            };
            debug!(
                "chnl: idle {}/{} discarded {} request(s)",
                proc_id,
                chnl_id,
                discarded.len()
            );
            return Ok(discarded);
        }

        loop {
            {
                let mut queues = object.queues.lock();
                if queues.state == ChannelState::Closed {
                    return Err(LinkError::GeneralFailure("channel closed"));
                }
                if queues.pool.requested_count() == 0 {
                    queues.state = ChannelState::Idled;
                    debug!("chnl: flush {}/{} drained", proc_id, chnl_id);
                    return Ok(Vec::new());
                }
            }
            object.idle_sync.wait(Timeout::Forever);
        }
    }

    // ========================================================================
    // Accessors for the driver side
    // ========================================================================

    pub fn get_channel_mode(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<ChannelMode> {
        Ok(self.object(proc_id, chnl_id)?.attrs.mode)
    }

    pub fn get_channel_endianism(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<Endianism> {
        Ok(self.object(proc_id, chnl_id)?.attrs.endianism)
    }

    pub fn get_channel_state(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<ChannelState> {
        Ok(self.object(proc_id, chnl_id)?.queues.lock().state)
    }

    /// Force a state; `Closed` is reserved for [`ChannelEngine::close`]
    pub fn set_channel_state(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        state: ChannelState,
    ) -> LinkResult<()> {
        if state == ChannelState::Closed {
            return Err(LinkError::InvalidArgument("state"));
        }
        let object = self.object(proc_id, chnl_id)?;
        let mut queues = object.queues.lock();
        if queues.state == ChannelState::Closed {
            return Err(LinkError::GeneralFailure("channel closed"));
        }
        queues.state = state;
        Ok(())
    }

    /// Any request pending on the channel
    pub fn channel_has_more_chirps(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<bool> {
        let object = self.object(proc_id, chnl_id)?;
        let has_more = object.queues.lock().pool.requested_count() > 0;
        Ok(has_more)
    }

    /// Oldest pending request, if any
    pub fn get_request_chirp(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<Option<ChirpHandle>> {
        let object = self.object(proc_id, chnl_id)?;
        let head = object.queues.lock().pool.head_request();
        Ok(head)
    }

    /// Run `f` on a pending chirp under the channel lock
    ///
    /// `f` must not call back into the engine.
    pub fn with_request_chirp<R>(
        &self,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        chirp: ChirpHandle,
        f: impl FnOnce(&mut Chirp) -> R,
    ) -> LinkResult<R> {
        let object = self.object(proc_id, chnl_id)?;
        let mut queues = object.queues.lock();
        let chirp = queues
            .pool
            .requested_chirp_mut(chirp)
            .ok_or(LinkError::InvalidArgument("chirp not pending"))?;
        Ok(f(chirp))
    }

    /// Current list sizes
    pub fn chirp_counts(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<ChirpCounts> {
        Ok(self.object(proc_id, chnl_id)?.counts())
    }
}

impl core::fmt::Debug for ChannelEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelEngine")
            .field("num_dsps", &self.num_dsps)
            .field("max_bufs", &self.max_bufs)
            .field("driver", &self.driver.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drv::NullDriver;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const P0: ProcessorId = ProcessorId(0);
    const C0: ChannelId = ChannelId(0);

    fn engine() -> ChannelEngine {
        let engine = ChannelEngine::new(1, 16, Arc::new(NullDriver));
        engine.initialize(P0).unwrap();
        engine
    }

    fn buf(arg: u32) -> IoInfo {
        IoInfo::new(vec![arg as u8; 16], 16).with_arg(arg)
    }

    fn complete_head(engine: &ChannelEngine, status: ChirpStatus) {
        let head = engine.get_request_chirp(P0, C0).unwrap().unwrap();
        engine.add_io_completion(P0, C0, head, status).unwrap();
    }

    #[test]
    fn test_initialize_twice_fails() {
        let engine = engine();
        assert_eq!(
            engine.initialize(P0),
            Err(LinkError::GeneralFailure("processor already initialized"))
        );
        engine.finalize(P0).unwrap();
        assert!(engine.finalize(P0).is_err());
    }

    #[test]
    fn test_open_validates() {
        let engine = engine();
        assert!(engine
            .open(P0, ChannelId(MAX_CHANNEL_IDS as u16), &ChannelAttrs::output(2))
            .is_err());
        assert_eq!(
            engine.open(P0, C0, &ChannelAttrs::output(0)),
            Err(LinkError::InvalidArgument("num_bufs"))
        );
        engine.open(P0, C0, &ChannelAttrs::output(2)).unwrap();
        assert_eq!(
            engine.open(P0, C0, &ChannelAttrs::output(2)),
            Err(LinkError::InvalidArgument("channel already open"))
        );
        assert_eq!(engine.get_channel_state(P0, C0), Ok(ChannelState::Idled));
    }

    #[test]
    fn test_request_exhaustion_is_backpressure() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::output(1)).unwrap();
        engine.add_io_request(P0, C0, buf(1)).unwrap();
        let (err, info) = engine.add_io_request(P0, C0, buf(2)).unwrap_err();
        assert_eq!(err, LinkError::OutOfMemory);
        assert_eq!(info.arg, 2);
    }

    #[test]
    fn test_fifo_completion() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::output(3)).unwrap();
        for arg in 1..=3 {
            engine.add_io_request(P0, C0, buf(arg)).unwrap();
        }
        assert_eq!(engine.get_channel_state(P0, C0), Ok(ChannelState::Ready));
        for _ in 0..3 {
            complete_head(&engine, ChirpStatus::COMPLETE);
        }
        for arg in 1..=3 {
            let info = engine.get_io_completion(P0, C0, Timeout::NoWait).unwrap();
            assert_eq!(info.arg, arg);
        }
        assert!(engine.chirp_counts(P0, C0).unwrap().is_conserved());
    }

    #[test]
    fn test_no_wait_poll_returns_immediately() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::input(1)).unwrap();
        let start = Instant::now();
        assert_eq!(
            engine.get_io_completion(P0, C0, Timeout::NoWait).unwrap_err(),
            LinkError::NoIoCompletion
        );
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::input(1)).unwrap();
        engine.add_io_request(P0, C0, buf(1)).unwrap();
        assert_eq!(
            engine.get_io_completion(P0, C0, Timeout::Millis(20)).unwrap_err(),
            LinkError::Timeout
        );
    }

    #[test]
    fn test_blocking_reclaim_wakes_on_completion() {
        let engine = Arc::new(engine());
        engine.open(P0, C0, &ChannelAttrs::output(1)).unwrap();
        engine.add_io_request(P0, C0, buf(9)).unwrap();

        let completer = Arc::clone(&engine);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            complete_head(&completer, ChirpStatus::COMPLETE);
        });
        let info = engine.get_io_completion(P0, C0, Timeout::Forever).unwrap();
        assert_eq!(info.arg, 9);
        handle.join().unwrap();
    }

    #[test]
    fn test_callback_runs_on_completion() {
        static SEEN: AtomicU32 = AtomicU32::new(0);
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::output(1)).unwrap();
        let callback: super::super::chirp::ChirpCallback =
            Arc::new(|_, _, arg, _| SEEN.store(arg, Ordering::SeqCst));
        engine
            .add_io_request(P0, C0, buf(42).with_callback(callback, true))
            .unwrap();
        complete_head(&engine, ChirpStatus::COMPLETE);
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
        let info = engine.get_io_completion(P0, C0, Timeout::NoWait).unwrap();
        assert!(info.dpc_context);
    }

    #[test]
    fn test_idle_input_discards_regardless_of_flush() {
        for flush in [false, true] {
            let engine = engine();
            engine.open(P0, C0, &ChannelAttrs::input(4)).unwrap();
            for arg in 0..4 {
                engine.add_io_request(P0, C0, buf(arg)).unwrap();
            }
            let discarded = engine.idle(P0, C0, flush).unwrap();
            assert_eq!(discarded.len(), 4);
            let counts = engine.chirp_counts(P0, C0).unwrap();
            assert_eq!(counts.requested, 0);
            assert_eq!(counts.free, 4);
            assert_eq!(engine.get_channel_state(P0, C0), Ok(ChannelState::Idled));
        }
    }

    #[test]
    fn test_idle_output_without_flush_discards() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::output(2)).unwrap();
        engine.add_io_request(P0, C0, buf(1)).unwrap();
        engine.add_io_request(P0, C0, buf(2)).unwrap();
        let discarded = engine.idle(P0, C0, false).unwrap();
        assert_eq!(discarded.len(), 2);
        assert!(discarded.iter().all(|info| info.status.is_canceled()));
    }

    #[test]
    fn test_flush_waits_for_natural_completion() {
        let engine = Arc::new(engine());
        engine.open(P0, C0, &ChannelAttrs::output(3)).unwrap();
        for arg in 0..3 {
            engine.add_io_request(P0, C0, buf(arg)).unwrap();
        }
        let completer = Arc::clone(&engine);
        let handle = thread::spawn(move || {
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(10));
                complete_head(&completer, ChirpStatus::COMPLETE);
            }
        });
        let discarded = engine.idle(P0, C0, true).unwrap();
        handle.join().unwrap();
        assert!(discarded.is_empty());
        let counts = engine.chirp_counts(P0, C0).unwrap();
        assert_eq!(counts.requested, 0);
        assert_eq!(counts.completed, 3);
    }

    #[test]
    fn test_eos_blocks_new_requests_until_idle() {
        let engine = engine();
        engine.open(P0, C0, &ChannelAttrs::input(2)).unwrap();
        engine.add_io_request(P0, C0, buf(1)).unwrap();
        complete_head(&engine, ChirpStatus::COMPLETE | ChirpStatus::EOS);
        assert_eq!(engine.get_channel_state(P0, C0), Ok(ChannelState::EndOfStream));
        let (err, _) = engine.add_io_request(P0, C0, buf(2)).unwrap_err();
        assert_eq!(err, LinkError::EndOfStream);
        engine.idle(P0, C0, false).unwrap();
        assert!(engine.add_io_request(P0, C0, buf(2)).is_ok());
    }

    #[test]
    fn test_close_wakes_blocked_reclaim() {
        let engine = Arc::new(engine());
        engine.open(P0, C0, &ChannelAttrs::input(1)).unwrap();
        engine.add_io_request(P0, C0, buf(5)).unwrap();
        let waiter = Arc::clone(&engine);
        let handle = thread::spawn(move || waiter.get_io_completion(P0, C0, Timeout::Forever));
        thread::sleep(Duration::from_millis(20));
        let drained = engine.close(P0, C0).unwrap();
        assert_eq!(drained.len(), 1);
        // Either woken by the close, or too late to find the channel at all
        assert!(matches!(
            handle.join().unwrap(),
            Err(LinkError::GeneralFailure("channel closed")) | Err(LinkError::InvalidArgument(_))
        ));
        assert!(!engine.is_open(P0, C0));
    }

    /// Refuses every request, optionally after completing it
    struct RefusingDriver {
        complete_first: bool,
    }

    impl LinkDriver for RefusingDriver {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn io_request(
            &self,
            engine: &ChannelEngine,
            proc_id: ProcessorId,
            chnl_id: ChannelId,
        ) -> LinkResult<()> {
            if self.complete_first {
                if let Some(head) = engine.get_request_chirp(proc_id, chnl_id)? {
                    engine.add_io_completion(proc_id, chnl_id, head, ChirpStatus::COMPLETE)?;
                }
            }
            Err(LinkError::GeneralFailure("link down"))
        }
    }

    #[test]
    fn test_driver_refusal_returns_buffer() {
        let engine = ChannelEngine::new(1, 16, Arc::new(RefusingDriver { complete_first: false }));
        engine.initialize(P0).unwrap();
        engine.open(P0, C0, &ChannelAttrs::output(2)).unwrap();

        let (err, info) = engine.add_io_request(P0, C0, buf(9)).unwrap_err();
        assert_eq!(err, LinkError::GeneralFailure("link down"));
        assert_eq!(info.arg, 9);
        assert_eq!(info.buffer.len(), 16);

        let counts = engine.chirp_counts(P0, C0).unwrap();
        assert_eq!((counts.free, counts.requested, counts.completed), (2, 0, 0));
        assert!(matches!(
            engine.get_io_completion(P0, C0, Timeout::NoWait),
            Err(LinkError::NoIoCompletion)
        ));

        // nothing pending, so a flushing idle returns at once
        let started = Instant::now();
        assert!(engine.idle(P0, C0, true).unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_driver_failure_after_completion_keeps_request() {
        let engine = ChannelEngine::new(1, 16, Arc::new(RefusingDriver { complete_first: true }));
        engine.initialize(P0).unwrap();
        engine.open(P0, C0, &ChannelAttrs::output(2)).unwrap();

        assert!(engine.add_io_request(P0, C0, buf(4)).is_ok());
        let info = engine.get_io_completion(P0, C0, Timeout::NoWait).unwrap();
        assert_eq!(info.arg, 4);
        assert!(info.status.is_complete());
    }
}
