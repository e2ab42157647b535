//! Channel Subsystem
//!
//! Buffer streaming between the GPP and a DSP:
//! - Chirp pools (fixed-capacity I/O request packets)
//! - The channel engine (per-channel queueing and state machine)
//! - The channel manager (process ownership)

pub mod chirp;
pub mod ldrv;
pub mod pmgr;

pub use chirp::{Chirp, ChirpCallback, ChirpHandle, ChirpPool, ChirpStatus, IoInfo};
pub use ldrv::{
    ChannelAttrs, ChannelEngine, ChannelMode, ChannelState, ChirpCounts, DataSize, Endianism,
};
pub use pmgr::ChannelManager;
