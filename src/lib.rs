//! dsplink - GPP side of a GPP/DSP inter-processor link
//!
//! Buffer streaming over channels and short control messages over
//! message queues between a host processor and its DSPs.
//!
//! ## Layers
//!
//! ```text
//!   ChannelManager        MsgqManager          ownership checks
//!         |                    |
//!   ChannelEngine   <---  LdrvMsgq             queueing, dispatch
//!         |            (remote transport)
//!     LinkDriver                               hardware side
//! ```
//!
//! A [`Link`] owns one instance of every layer.

pub mod chnl;
pub mod config;
pub mod drv;
pub mod error;
pub mod link;
pub mod msgq;
pub mod osal;
pub mod proc;
pub mod types;

pub use config::LinkConfig;
pub use error::{LinkError, LinkResult};
pub use link::Link;
pub use types::{ChannelId, MqaId, MqtId, MsgqId, ProcessorId, Timeout};
