//! Messages - Header, body and wire frames
//!
//! Every message starts with a fixed header naming its size, the allocator
//! it came from, its reply address, its destination and a message id. The
//! body follows. A message value is owned by exactly one holder at a time
//! (allocator, sender, transport, receiver) and is moved, never copied,
//! between them.
//!
//! ## Frame layout
//!
//! Messages crossing to a DSP are written as frames in the channel's byte
//! order:
//!
//! ```text
//!   0      2       4         6         8         10       12
//!   +------+-------+---------+---------+---------+--------+----------
//!   | size | mqaId | srcProc | srcMsgq | dstMsgq | msgId  | body ...
//!   +------+-------+---------+---------+---------+--------+----------
//! ```

use core::fmt;

use crate::chnl::Endianism;
use crate::error::{LinkError, LinkResult};
use crate::types::{MqaId, MsgqId, ProcessorId};

// ============================================================================
// Constants
// ============================================================================

/// Size of the encoded header
pub const MSG_HEADER_SIZE: usize = 12;

/// First message id reserved for the link itself
pub const MSGQ_INTERNAL_ID_START: u16 = 0xFF00;

/// Asynchronous error notification delivered to the error handler queue
pub const MSGQ_ASYNC_ERROR_MSGID: u16 = 0xFF00;

/// Locate request sent to a remote processor
pub const MSGQ_LOCATE_MSGID: u16 = 0xFF01;

/// Reply to a locate request
pub const MSGQ_LOCATE_ACK_MSGID: u16 = 0xFF02;

// ============================================================================
// Byte order helpers
// ============================================================================

fn is_big(endianism: Endianism) -> bool {
    endianism == Endianism::Big
}

pub(crate) fn put_u16(out: &mut [u8], endianism: Endianism, value: u16) {
    let bytes = if is_big(endianism) {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    out[..2].copy_from_slice(&bytes);
}

pub(crate) fn get_u16(bytes: &[u8], endianism: Endianism) -> u16 {
    let raw = [bytes[0], bytes[1]];
    if is_big(endianism) {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    }
}

pub(crate) fn put_u32(out: &mut [u8], endianism: Endianism, value: u32) {
    let bytes = if is_big(endianism) {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    out[..4].copy_from_slice(&bytes);
}

pub(crate) fn get_u32(bytes: &[u8], endianism: Endianism) -> u32 {
    let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if is_big(endianism) {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

// ============================================================================
// Header
// ============================================================================

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total size including the header
    pub size: u16,
    /// Allocator the message belongs to
    pub mqa_id: MqaId,
    /// Processor of the reply queue
    pub src_proc: ProcessorId,
    /// Reply queue, or `MsgqId::INVALID`
    pub src_msgq: MsgqId,
    /// Destination queue
    pub dst_msgq: MsgqId,
    /// User message id
    pub msg_id: u16,
}

impl MsgHeader {
    pub fn new(size: u16, mqa_id: MqaId) -> Self {
        Self {
            size,
            mqa_id,
            src_proc: ProcessorId::default(),
            src_msgq: MsgqId::INVALID,
            dst_msgq: MsgqId::INVALID,
            msg_id: 0,
        }
    }

    /// Write the header into the first `MSG_HEADER_SIZE` bytes of `out`
    pub fn encode(&self, endianism: Endianism, out: &mut [u8]) -> LinkResult<()> {
        if out.len() < MSG_HEADER_SIZE {
            return Err(LinkError::InvalidArgument("frame too short"));
        }
        put_u16(&mut out[0..], endianism, self.size);
        put_u16(&mut out[2..], endianism, self.mqa_id.0);
        put_u16(&mut out[4..], endianism, self.src_proc.0);
        put_u16(&mut out[6..], endianism, self.src_msgq.0);
        put_u16(&mut out[8..], endianism, self.dst_msgq.0);
        put_u16(&mut out[10..], endianism, self.msg_id);
        Ok(())
    }

    pub fn decode(endianism: Endianism, bytes: &[u8]) -> LinkResult<Self> {
        if bytes.len() < MSG_HEADER_SIZE {
            return Err(LinkError::InvalidArgument("frame too short"));
        }
        let header = Self {
            size: get_u16(&bytes[0..], endianism),
            mqa_id: MqaId(get_u16(&bytes[2..], endianism)),
            src_proc: ProcessorId(get_u16(&bytes[4..], endianism)),
            src_msgq: MsgqId(get_u16(&bytes[6..], endianism)),
            dst_msgq: MsgqId(get_u16(&bytes[8..], endianism)),
            msg_id: get_u16(&bytes[10..], endianism),
        };
        if (header.size as usize) < MSG_HEADER_SIZE || header.size as usize > bytes.len() {
            return Err(LinkError::InvalidArgument("frame size"));
        }
        Ok(header)
    }

    /// Link-internal control message
    pub fn is_internal(&self) -> bool {
        self.msg_id >= MSGQ_INTERNAL_ID_START && self.msg_id != MSGQ_ASYNC_ERROR_MSGID
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message and its body buffer
pub struct MsgqMsg {
    header: MsgHeader,
    body: Vec<u8>,
}

impl MsgqMsg {
    /// Assemble a message from an allocator buffer
    pub(crate) fn from_parts(header: MsgHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Split into header and body buffer (allocator free path)
    pub(crate) fn into_parts(self) -> (MsgHeader, Vec<u8>) {
        (self.header, self.body)
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut MsgHeader {
        &mut self.header
    }

    pub fn msg_id(&self) -> u16 {
        self.header.msg_id
    }

    /// Total size including the header
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn mqa_id(&self) -> MqaId {
        self.header.mqa_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body
    }

    /// Write header and body into `out` as one frame
    pub fn encode_frame(&self, endianism: Endianism, out: &mut Vec<u8>) -> LinkResult<()> {
        out.clear();
        out.resize(MSG_HEADER_SIZE, 0);
        self.header.encode(endianism, out)?;
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

impl fmt::Debug for MsgqMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgqMsg")
            .field("header", &self.header)
            .field("body_len", &self.body.len())
            .finish()
    }
}

// ============================================================================
// Asynchronous Errors
// ============================================================================

/// Transport-level error reported to the error handler queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgqErrorKind {
    /// A remote processor went away
    LinkFailure = 1,
    /// Incoming message could not be allocated locally
    AllocatorFailure = 2,
    /// Incoming message addressed an unknown queue
    UnknownQueue = 3,
}

impl MsgqErrorKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::LinkFailure),
            2 => Some(Self::AllocatorFailure),
            3 => Some(Self::UnknownQueue),
            _ => None,
        }
    }
}

/// Body of an `MSGQ_ASYNC_ERROR_MSGID` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgqAsyncError {
    pub kind: MsgqErrorKind,
    pub arg1: u32,
    pub arg2: u32,
}

impl MsgqAsyncError {
    /// Encoded body length
    pub const BODY_SIZE: usize = 10;

    pub fn encode(&self, out: &mut [u8]) -> LinkResult<()> {
        if out.len() < Self::BODY_SIZE {
            return Err(LinkError::InvalidArgument("error body too short"));
        }
        put_u16(&mut out[0..], Endianism::Default, self.kind as u16);
        put_u32(&mut out[2..], Endianism::Default, self.arg1);
        put_u32(&mut out[6..], Endianism::Default, self.arg2);
        Ok(())
    }

    /// Decode the body of a received error message
    pub fn decode(msg: &MsgqMsg) -> LinkResult<Self> {
        let body = msg.body();
        if msg.msg_id() != MSGQ_ASYNC_ERROR_MSGID || body.len() < Self::BODY_SIZE {
            return Err(LinkError::InvalidArgument("not an error message"));
        }
        let kind = MsgqErrorKind::from_u16(get_u16(body, Endianism::Default))
            .ok_or(LinkError::InvalidArgument("error kind"))?;
        Ok(Self {
            kind,
            arg1: get_u32(&body[2..], Endianism::Default),
            arg2: get_u32(&body[6..], Endianism::Default),
        })
    }
}

// ============================================================================
// Locate Frames
// ============================================================================

/// Locate request or acknowledgement
///
/// The queue being located travels in the header's `dst_msgq`; the body
/// carries the request sequence number and, in the ack, whether the
/// queue exists on the answering processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateFrame {
    /// Sender of the frame
    pub proc_id: ProcessorId,
    pub msgq_id: MsgqId,
    pub seq: u32,
    pub found: bool,
}

impl LocateFrame {
    /// Encoded body length
    pub const BODY_SIZE: usize = 8;

    /// Encode as a complete frame carrying `msg_id`
    pub fn encode(&self, msg_id: u16, endianism: Endianism, out: &mut Vec<u8>) -> LinkResult<()> {
        let size = MSG_HEADER_SIZE + Self::BODY_SIZE;
        let header = MsgHeader {
            size: size as u16,
            mqa_id: MqaId(0),
            src_proc: self.proc_id,
            src_msgq: self.msgq_id,
            dst_msgq: self.msgq_id,
            msg_id,
        };
        out.clear();
        out.resize(size, 0);
        header.encode(endianism, out)?;
        put_u32(&mut out[MSG_HEADER_SIZE..], endianism, self.seq);
        put_u32(&mut out[MSG_HEADER_SIZE + 4..], endianism, u32::from(self.found));
        Ok(())
    }

    /// Decode the body of a frame whose header was already parsed
    pub fn decode(header: &MsgHeader, endianism: Endianism, frame: &[u8]) -> LinkResult<Self> {
        if frame.len() < MSG_HEADER_SIZE + Self::BODY_SIZE {
            return Err(LinkError::InvalidArgument("locate frame too short"));
        }
        let body = &frame[MSG_HEADER_SIZE..];
        Ok(Self {
            proc_id: header.src_proc,
            msgq_id: header.dst_msgq,
            seq: get_u32(body, endianism),
            found: get_u32(&body[4..], endianism) != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MsgHeader {
        MsgHeader {
            size: 20,
            mqa_id: MqaId(1),
            src_proc: ProcessorId(2),
            src_msgq: MsgqId(3),
            dst_msgq: MsgqId(4),
            msg_id: 0x1234,
        }
    }

    #[test]
    fn test_header_byte_order() {
        let mut le = [0u8; MSG_HEADER_SIZE + 8];
        let mut be = [0u8; MSG_HEADER_SIZE + 8];
        header().encode(Endianism::Little, &mut le).unwrap();
        header().encode(Endianism::Big, &mut be).unwrap();
        assert_eq!(&le[10..12], &[0x34, 0x12]);
        assert_eq!(&be[10..12], &[0x12, 0x34]);
        assert_eq!(MsgHeader::decode(Endianism::Big, &be).unwrap(), header());
        assert_eq!(MsgHeader::decode(Endianism::Default, &le).unwrap(), header());
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        let mut bytes = [0u8; MSG_HEADER_SIZE];
        header().encode(Endianism::Little, &mut bytes).unwrap();
        // Header claims 20 bytes but only 12 are present
        assert!(MsgHeader::decode(Endianism::Little, &bytes).is_err());
        assert!(MsgHeader::decode(Endianism::Little, &bytes[..4]).is_err());
    }

    #[test]
    fn test_frame_carries_body() {
        let msg = MsgqMsg::from_parts(header(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut frame = Vec::with_capacity(64);
        msg.encode_frame(Endianism::Little, &mut frame).unwrap();
        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[MSG_HEADER_SIZE..], msg.body());
    }

    #[test]
    fn test_internal_ids() {
        let mut h = header();
        assert!(!h.is_internal());
        h.msg_id = MSGQ_LOCATE_MSGID;
        assert!(h.is_internal());
        h.msg_id = MSGQ_ASYNC_ERROR_MSGID;
        assert!(!h.is_internal());
    }

    #[test]
    fn test_locate_frame() {
        let ack = LocateFrame {
            proc_id: ProcessorId(0),
            msgq_id: MsgqId(5),
            seq: 42,
            found: true,
        };
        let mut frame = Vec::new();
        ack.encode(MSGQ_LOCATE_ACK_MSGID, Endianism::Big, &mut frame).unwrap();
        let header = MsgHeader::decode(Endianism::Big, &frame).unwrap();
        assert_eq!(header.msg_id, MSGQ_LOCATE_ACK_MSGID);
        assert_eq!(LocateFrame::decode(&header, Endianism::Big, &frame).unwrap(), ack);
    }

    #[test]
    fn test_async_error_body() {
        let mut h = header();
        h.msg_id = MSGQ_ASYNC_ERROR_MSGID;
        let mut body = vec![0u8; MsgqAsyncError::BODY_SIZE];
        let err = MsgqAsyncError {
            kind: MsgqErrorKind::AllocatorFailure,
            arg1: 7,
            arg2: 0xDEAD,
        };
        err.encode(&mut body).unwrap();
        let msg = MsgqMsg::from_parts(h, body);
        assert_eq!(MsgqAsyncError::decode(&msg).unwrap(), err);
    }
}
