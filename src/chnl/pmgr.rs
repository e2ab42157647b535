//! Channel Manager - Process ownership over channels
//!
//! Records which process created each user channel and refuses every
//! mutating call from any other process with `AccessDenied`. The engine
//! below trusts its caller completely; this is the only authorization gate.
//!
//! The two message channels (`ID_MSGCHNL_TO_DSP`, `ID_MSGCHNL_FM_DSP`) are
//! reserved for the remote message transport and cannot be created here.

use std::sync::Arc;

use log::{debug, warn};
use spin::RwLock;

use super::chirp::IoInfo;
use super::ldrv::{ChannelAttrs, ChannelEngine};
use crate::error::{LinkError, LinkResult};
use crate::osal::{MemoryService, PrcsId, PrcsToken};
use crate::proc::ProcRegistry;
use crate::types::{ChannelId, ProcessorId, Timeout, MAX_CHANNELS, MAX_DSPS};

type OwnerArray = [[Option<PrcsId>; MAX_CHANNELS]; MAX_DSPS];

/// Ownership layer above the channel engine
pub struct ChannelManager {
    engine: Arc<ChannelEngine>,
    procs: Arc<ProcRegistry>,
    memory: Arc<dyn MemoryService>,
    owners: RwLock<OwnerArray>,
}

impl ChannelManager {
    pub fn new(
        engine: Arc<ChannelEngine>,
        procs: Arc<ProcRegistry>,
        memory: Arc<dyn MemoryService>,
    ) -> Self {
        Self {
            engine,
            procs,
            memory,
            owners: RwLock::new([[None; MAX_CHANNELS]; MAX_DSPS]),
        }
    }

    fn check_ids(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<()> {
        if proc_id.index() >= self.engine.num_dsps() {
            return Err(LinkError::InvalidArgument("processor id"));
        }
        if chnl_id.index() >= MAX_CHANNELS {
            return Err(LinkError::InvalidArgument("channel id"));
        }
        Ok(())
    }

    /// Recorded owner of a channel
    pub fn owner(&self, proc_id: ProcessorId, chnl_id: ChannelId) -> Option<PrcsId> {
        self.check_ids(proc_id, chnl_id).ok()?;
        self.owners.read()[proc_id.index()][chnl_id.index()]
    }

    /// Check whether `caller` created the channel
    pub fn is_owner(&self, caller: &PrcsToken, proc_id: ProcessorId, chnl_id: ChannelId) -> bool {
        caller.owns(self.owner(proc_id, chnl_id))
    }

    fn authorize(&self, caller: &PrcsToken, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<()> {
        self.check_ids(proc_id, chnl_id)?;
        if self.is_owner(caller, proc_id, chnl_id) {
            Ok(())
        } else {
            Err(LinkError::AccessDenied)
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a channel owned by `caller`
    pub fn create(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        attrs: &ChannelAttrs,
    ) -> LinkResult<()> {
        self.check_ids(proc_id, chnl_id)?;
        {
            let mut owners = self.owners.write();
            let slot = &mut owners[proc_id.index()][chnl_id.index()];
            if slot.is_some() {
                return Err(LinkError::AlreadyConnected);
            }
            self.procs.check_attached(proc_id, caller)?;
            *slot = Some(caller.id());
        }

        if let Err(e) = self.engine.open(proc_id, chnl_id, attrs) {
            self.owners.write()[proc_id.index()][chnl_id.index()] = None;
            return Err(e);
        }
        debug!("pmgr chnl: {:?} owns {}/{}", caller.id(), proc_id, chnl_id);
        Ok(())
    }

    /// Delete a channel; buffers still queued are handed back
    pub fn delete(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<Vec<IoInfo>> {
        self.authorize(caller, proc_id, chnl_id)?;
        let drained = self.engine.close(proc_id, chnl_id)?;
        self.owners.write()[proc_id.index()][chnl_id.index()] = None;
        Ok(drained)
    }

    /// Delete every channel `caller` still owns (process exit)
    pub fn cleanup(&self, caller: &PrcsToken) -> usize {
        let mut closed = 0;
        for proc in 0..self.engine.num_dsps() {
            for chnl in 0..MAX_CHANNELS {
                let (proc_id, chnl_id) = (ProcessorId(proc as u16), ChannelId(chnl as u16));
                if self.is_owner(caller, proc_id, chnl_id) {
                    match self.delete(caller, proc_id, chnl_id) {
                        Ok(_) => closed += 1,
                        Err(e) => warn!("pmgr chnl: cleanup of {}/{} failed: {}", proc_id, chnl_id, e),
                    }
                }
            }
        }
        closed
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Queue a buffer; the descriptor is handed back on failure
    pub fn issue(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        info: IoInfo,
    ) -> Result<(), (LinkError, IoInfo)> {
        if let Err(e) = self.authorize(caller, proc_id, chnl_id) {
            return Err((e, info));
        }
        self.engine.add_io_request(proc_id, chnl_id, info)
    }

    /// Take back the oldest completed buffer
    pub fn reclaim(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        timeout: Timeout,
    ) -> LinkResult<IoInfo> {
        self.authorize(caller, proc_id, chnl_id)?;
        self.engine.get_io_completion(proc_id, chnl_id, timeout)
    }

    /// Discard pending requests without waiting
    pub fn idle(&self, caller: &PrcsToken, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<Vec<IoInfo>> {
        self.authorize(caller, proc_id, chnl_id)?;
        self.engine.idle(proc_id, chnl_id, false)
    }

    /// Wait for pending output to drain (input channels discard)
    pub fn flush(&self, caller: &PrcsToken, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<Vec<IoInfo>> {
        self.authorize(caller, proc_id, chnl_id)?;
        self.engine.idle(proc_id, chnl_id, true)
    }

    /// Device-specific channel control; no commands are supported
    pub fn control(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        _cmd: u32,
        _arg: u32,
    ) -> LinkResult<()> {
        self.authorize(caller, proc_id, chnl_id)?;
        Err(LinkError::NotImplemented)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    /// Allocate `num_bufs` buffers of `size` bytes, all or nothing
    pub fn allocate_buffer(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        size: usize,
        num_bufs: usize,
    ) -> LinkResult<Vec<Vec<u8>>> {
        self.authorize(caller, proc_id, chnl_id)?;
        if num_bufs == 0 {
            return Err(LinkError::InvalidArgument("num_bufs"));
        }
        let mut bufs = Vec::with_capacity(num_bufs);
        for _ in 0..num_bufs {
            match self.memory.alloc(size) {
                Ok(buf) => bufs.push(buf),
                Err(e) => {
                    warn!(
                        "pmgr chnl: buffer {}/{} on {}/{} failed, rolling back",
                        bufs.len() + 1,
                        num_bufs,
                        proc_id,
                        chnl_id
                    );
                    for buf in bufs.drain(..) {
                        self.memory.free(buf);
                    }
                    return Err(e);
                }
            }
        }
        Ok(bufs)
    }

    /// Return buffers obtained from [`ChannelManager::allocate_buffer`]
    pub fn free_buffer(
        &self,
        caller: &PrcsToken,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
        bufs: Vec<Vec<u8>>,
    ) -> LinkResult<()> {
        self.authorize(caller, proc_id, chnl_id)?;
        for buf in bufs {
            self.memory.free(buf);
        }
        Ok(())
    }

    pub fn engine(&self) -> &Arc<ChannelEngine> {
        &self.engine
    }
}
