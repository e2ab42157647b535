//! Loopback Driver - Host-side stand-in for a DSP
//!
//! Data channels are paired: channel `n` talks to channel `n ^ 1`. Bytes
//! queued on the output side of a pair are copied into the oldest receive
//! buffer of the input side and both chirps complete.
//!
//! The two message channels are answered by an emulated DSP message peer:
//! - locate requests are acknowledged, found if the queue was registered
//!   with [`LoopbackDriver::register_dsp_queue`]
//! - messages sent to a registered queue are echoed back to their reply
//!   queue with source and destination swapped
//!
//! Work is serialized through a single pump. A caller that finds the pump
//! busy leaves its work item queued and the pump owner picks it up, which
//! also makes completion callbacks that queue more I/O safe.

use std::collections::VecDeque;

use log::{trace, warn};
use spin::{Mutex, RwLock};

use super::LinkDriver;
use crate::chnl::{ChannelEngine, ChannelMode, ChirpStatus};
use crate::error::{LinkError, LinkResult};
use crate::msgq::msg::{LocateFrame, MsgHeader, MSGQ_LOCATE_ACK_MSGID, MSGQ_LOCATE_MSGID};
use crate::types::{
    ChannelId, MsgqId, ProcessorId, ID_MSGCHNL_FM_DSP, ID_MSGCHNL_TO_DSP, MAX_CHANNELS, MAX_DSPS,
};

/// Loopback link driver
pub struct LoopbackDriver {
    /// Queues the emulated DSP owns
    dsp_queues: RwLock<Vec<(ProcessorId, MsgqId)>>,
    /// Frames waiting for a receive buffer on `ID_MSGCHNL_FM_DSP`
    pending: [Mutex<VecDeque<Vec<u8>>>; MAX_DSPS],
    work: Mutex<VecDeque<(ProcessorId, ChannelId)>>,
    pump: Mutex<()>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self {
            dsp_queues: RwLock::new(Vec::new()),
            pending: core::array::from_fn(|_| Mutex::new(VecDeque::new())),
            work: Mutex::new(VecDeque::new()),
            pump: Mutex::new(()),
        }
    }

    /// Make `msgq_id` exist on the emulated DSP
    pub fn register_dsp_queue(&self, proc_id: ProcessorId, msgq_id: MsgqId) {
        let mut queues = self.dsp_queues.write();
        if !queues.contains(&(proc_id, msgq_id)) {
            queues.push((proc_id, msgq_id));
        }
    }

    pub fn unregister_dsp_queue(&self, proc_id: ProcessorId, msgq_id: MsgqId) {
        self.dsp_queues.write().retain(|q| *q != (proc_id, msgq_id));
    }

    fn is_dsp_queue(&self, proc_id: ProcessorId, msgq_id: MsgqId) -> bool {
        self.dsp_queues.read().contains(&(proc_id, msgq_id))
    }

    /// Frames generated but not yet delivered
    pub fn pending_frames(&self, proc_id: ProcessorId) -> usize {
        self.pending
            .get(proc_id.index())
            .map(|p| p.lock().len())
            .unwrap_or(0)
    }

    // ========================================================================
    // Pump
    // ========================================================================

    fn run(&self, engine: &ChannelEngine) {
        loop {
            let Some(guard) = self.pump.try_lock() else {
                return;
            };
            loop {
                let item = self.work.lock().pop_front();
                let Some((proc_id, chnl_id)) = item else { break };
                if let Err(e) = self.service(engine, proc_id, chnl_id) {
                    trace!("loopback: {}/{} not serviced: {}", proc_id, chnl_id, e);
                }
            }
            drop(guard);
            if self.work.lock().is_empty() {
                return;
            }
        }
    }

    fn service(&self, engine: &ChannelEngine, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<()> {
        if chnl_id == ID_MSGCHNL_TO_DSP {
            self.consume_messages(engine, proc_id)?;
            self.deliver_pending(engine, proc_id)
        } else if chnl_id == ID_MSGCHNL_FM_DSP {
            self.deliver_pending(engine, proc_id)
        } else if chnl_id.index() < MAX_CHANNELS {
            self.pump_pair(engine, proc_id, chnl_id)
        } else {
            Err(LinkError::InvalidArgument("channel id"))
        }
    }

    // ========================================================================
    // Data channels
    // ========================================================================

    fn pump_pair(&self, engine: &ChannelEngine, proc_id: ProcessorId, chnl_id: ChannelId) -> LinkResult<()> {
        let peer = ChannelId(chnl_id.0 ^ 1);
        if !engine.is_open(proc_id, peer) {
            return Ok(());
        }
        let (output, input) = match (
            engine.get_channel_mode(proc_id, chnl_id)?,
            engine.get_channel_mode(proc_id, peer)?,
        ) {
            (ChannelMode::Output, ChannelMode::Input) => (chnl_id, peer),
            (ChannelMode::Input, ChannelMode::Output) => (peer, chnl_id),
            _ => {
                warn!("loopback: {}/{} and {} have the same mode", proc_id, chnl_id, peer);
                return Ok(());
            }
        };

        loop {
            let (Some(tx), Some(rx)) = (
                engine.get_request_chirp(proc_id, output)?,
                engine.get_request_chirp(proc_id, input)?,
            ) else {
                return Ok(());
            };
            let data = engine.with_request_chirp(proc_id, output, tx, |chirp| chirp.data().to_vec())?;
            let copied = engine.with_request_chirp(proc_id, input, rx, |chirp| {
                let n = data.len().min(chirp.buffer().len());
                chirp.buffer_mut()[..n].copy_from_slice(&data[..n]);
                chirp.set_size(n);
                n
            })?;
            if copied < data.len() {
                warn!(
                    "loopback: {}/{} truncated {} -> {} bytes",
                    proc_id,
                    input,
                    data.len(),
                    copied
                );
            }
            engine.add_io_completion(proc_id, output, tx, ChirpStatus::COMPLETE)?;
            engine.add_io_completion(proc_id, input, rx, ChirpStatus::COMPLETE)?;
        }
    }

    // ========================================================================
    // Message peer
    // ========================================================================

    fn consume_messages(&self, engine: &ChannelEngine, proc_id: ProcessorId) -> LinkResult<()> {
        let endianism = engine.get_channel_endianism(proc_id, ID_MSGCHNL_TO_DSP)?;
        while let Some(chirp) = engine.get_request_chirp(proc_id, ID_MSGCHNL_TO_DSP)? {
            let frame =
                engine.with_request_chirp(proc_id, ID_MSGCHNL_TO_DSP, chirp, |c| c.data().to_vec())?;
            engine.add_io_completion(proc_id, ID_MSGCHNL_TO_DSP, chirp, ChirpStatus::COMPLETE)?;

            match self.answer(proc_id, endianism, &frame) {
                Ok(Some(reply)) => {
                    if let Some(pending) = self.pending.get(proc_id.index()) {
                        pending.lock().push_back(reply);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("loopback: dropped frame from GPP on {}: {}", proc_id, e),
            }
        }
        Ok(())
    }

    /// Build the DSP's reply to one frame, if it sends one
    fn answer(
        &self,
        proc_id: ProcessorId,
        endianism: crate::chnl::Endianism,
        frame: &[u8],
    ) -> LinkResult<Option<Vec<u8>>> {
        let header = MsgHeader::decode(endianism, frame)?;
        if header.msg_id == MSGQ_LOCATE_MSGID {
            let request = LocateFrame::decode(&header, endianism, frame)?;
            let ack = LocateFrame {
                proc_id,
                msgq_id: request.msgq_id,
                seq: request.seq,
                found: self.is_dsp_queue(proc_id, request.msgq_id),
            };
            let mut reply = Vec::new();
            ack.encode(MSGQ_LOCATE_ACK_MSGID, endianism, &mut reply)?;
            return Ok(Some(reply));
        }
        if !self.is_dsp_queue(proc_id, header.dst_msgq) {
            return Err(LinkError::NotFound);
        }
        if !header.src_msgq.is_valid() {
            trace!("loopback: message to {} has no reply queue", header.dst_msgq);
            return Ok(None);
        }
        let echo = MsgHeader {
            src_proc: proc_id,
            src_msgq: header.dst_msgq,
            dst_msgq: header.src_msgq,
            ..header
        };
        let mut reply = frame[..header.size as usize].to_vec();
        echo.encode(endianism, &mut reply)?;
        Ok(Some(reply))
    }

    fn deliver_pending(&self, engine: &ChannelEngine, proc_id: ProcessorId) -> LinkResult<()> {
        let Some(pending) = self.pending.get(proc_id.index()) else {
            return Err(LinkError::InvalidArgument("processor id"));
        };
        if !engine.is_open(proc_id, ID_MSGCHNL_FM_DSP) {
            return Ok(());
        }
        loop {
            if pending.lock().is_empty() {
                return Ok(());
            }
            let Some(chirp) = engine.get_request_chirp(proc_id, ID_MSGCHNL_FM_DSP)? else {
                return Ok(());
            };
            let Some(frame) = pending.lock().pop_front() else {
                return Ok(());
            };
            let fits = engine.with_request_chirp(proc_id, ID_MSGCHNL_FM_DSP, chirp, |c| {
                if frame.len() > c.buffer().len() {
                    return false;
                }
                c.buffer_mut()[..frame.len()].copy_from_slice(&frame);
                c.set_size(frame.len());
                true
            })?;
            if !fits {
                warn!("loopback: {} byte frame exceeds receive buffer on {}", frame.len(), proc_id);
                continue;
            }
            engine.add_io_completion(proc_id, ID_MSGCHNL_FM_DSP, chirp, ChirpStatus::COMPLETE)?;
        }
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkDriver for LoopbackDriver {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn io_request(
        &self,
        engine: &ChannelEngine,
        proc_id: ProcessorId,
        chnl_id: ChannelId,
    ) -> LinkResult<()> {
        self.work.lock().push_back((proc_id, chnl_id));
        self.run(engine);
        Ok(())
    }

    fn channel_closed(&self, proc_id: ProcessorId, chnl_id: ChannelId) {
        if chnl_id == ID_MSGCHNL_FM_DSP {
            if let Some(pending) = self.pending.get(proc_id.index()) {
                pending.lock().clear();
            }
        }
    }
}

impl core::fmt::Debug for LoopbackDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackDriver")
            .field("dsp_queues", &self.dsp_queues.read().len())
            .finish()
    }
}
