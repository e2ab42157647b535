//! Unified status taxonomy for the link stack using thiserror
//!
//! Every entry point returns a [`LinkResult`]; nothing panics on a
//! caller error.

use thiserror::Error;

use crate::types::ProcessorId;

/// Status of a failed link operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Bad id, missing attributes or out-of-range value
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Caller is not the recorded owner
    #[error("access denied")]
    AccessDenied,

    /// Object with this id already exists
    #[error("already exists")]
    AlreadyExists,

    /// Channel already has an owning process
    #[error("already connected")]
    AlreadyConnected,

    /// Caller has not attached to the processor
    #[error("process not attached to {0}")]
    NotAttached(ProcessorId),

    /// Queue or object is not registered; retryable for locate
    #[error("not found")]
    NotFound,

    /// Bounded wait expired
    #[error("timed out")]
    Timeout,

    /// Non-blocking reclaim found nothing completed
    #[error("no I/O completion available")]
    NoIoCompletion,

    /// Channel reached end of stream
    #[error("end of stream")]
    EndOfStream,

    /// Pool or table allocation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Entry point intentionally omitted in this configuration
    #[error("not implemented")]
    NotImplemented,

    /// Underlying transport or driver failure
    #[error("general failure: {0}")]
    GeneralFailure(&'static str),
}

impl LinkError {
    /// Locate treats these as "try again later" rather than hard failures
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::NotFound | LinkError::Timeout)
    }
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;
