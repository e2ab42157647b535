//! Message Queue Subsystem
//!
//! Short control messages between the GPP and its DSPs:
//! - Messages and their wire frames
//! - Allocators (MQA) bound to small integer ids
//! - Transports (MQT), local and over the DSP message channels
//! - The queue layer (create, locate, put, get)
//! - The msgq manager (process ownership)

pub mod ldrv;
pub mod mqa;
pub mod mqt;
pub mod msg;
pub mod pmgr;

pub use ldrv::{LdrvMsgq, MsgqLocateAttrs, MsgqShared, MsgqStatus};
pub use mqa::{Allocator, PoolAllocator, PoolAttrs, PoolStats};
pub use mqt::{LocalTransport, RemoteAttrs, RemoteTransport, Transport, TransportAttrs};
pub use msg::{MsgHeader, MsgqAsyncError, MsgqErrorKind, MsgqMsg, MSG_HEADER_SIZE};
pub use pmgr::MsgqManager;
