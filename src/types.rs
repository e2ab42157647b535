//! Common types used across the link stack
//!
//! Small-integer identifiers, compile-time limits and the timeout
//! vocabulary shared by the channel and message-queue subsystems.

use core::fmt;
use core::time::Duration;

// ============================================================================
// Compile-time Limits
// ============================================================================

/// Maximum number of DSPs a single link instance can drive
pub const MAX_DSPS: usize = 2;

/// Maximum number of processors (all DSPs plus the GPP)
pub const MAX_PROCESSORS: usize = MAX_DSPS + 1;

/// Number of user data channels per DSP
pub const MAX_CHANNELS: usize = 16;

/// Reserved channel carrying messages from the GPP to the DSP
pub const ID_MSGCHNL_TO_DSP: ChannelId = ChannelId(MAX_CHANNELS as u16);

/// Reserved channel carrying messages from the DSP to the GPP
pub const ID_MSGCHNL_FM_DSP: ChannelId = ChannelId(MAX_CHANNELS as u16 + 1);

/// Total channel ids per DSP (user channels plus the two message channels)
pub const MAX_CHANNEL_IDS: usize = MAX_CHANNELS + 2;

/// Maximum number of message queues per processor
pub const MAX_MSGQS: usize = 32;

/// Processor id of the GPP itself
pub const ID_GPP: ProcessorId = ProcessorId(MAX_DSPS as u16);

/// Maximum number of processes that may attach to one DSP
pub const MAX_ATTACHED: usize = 16;

/// Maximum number of independent locators per remote queue
pub const MAX_LOCATORS: usize = 16;

// ============================================================================
// Identifiers
// ============================================================================

/// Processor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessorId(pub u16);

impl ProcessorId {
    /// Index into per-processor tables
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check whether this id names a DSP
    pub const fn is_dsp(self) -> bool {
        (self.0 as usize) < MAX_DSPS
    }
}

/// Channel identifier (per processor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChannelId(pub u16);

impl ChannelId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check whether this is one of the two reserved message channels
    pub const fn is_message_channel(self) -> bool {
        self.0 == ID_MSGCHNL_TO_DSP.0 || self.0 == ID_MSGCHNL_FM_DSP.0
    }
}

/// Message queue identifier (per processor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MsgqId(pub u16);

impl MsgqId {
    /// Marks "no queue" in message headers (e.g. no reply address)
    pub const INVALID: Self = Self(0xFFFF);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

/// Message allocator identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MqaId(pub u16);

impl MqaId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Message transport identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MqtId(pub u16);

impl MqtId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

macro_rules! impl_id_display {
    ($($ty:ident => $prefix:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        )*
    };
}

impl_id_display! {
    ProcessorId => "proc",
    ChannelId => "chnl",
    MsgqId => "msgq",
    MqaId => "mqa",
    MqtId => "mqt",
}

// ============================================================================
// Timeouts
// ============================================================================

/// How long a blocking call may suspend the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Return immediately with a distinguishable "nothing ready" result
    NoWait,
    /// Block until the condition holds
    #[default]
    Forever,
    /// Block for at most this many milliseconds
    Millis(u32),
}

impl Timeout {
    /// Bounded duration, or `None` for `Forever`
    pub fn duration(self) -> Option<Duration> {
        match self {
            Timeout::NoWait => Some(Duration::ZERO),
            Timeout::Forever => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(u64::from(ms))),
        }
    }

    pub fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Millis(0))
    }
}
