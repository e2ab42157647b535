//! OS Adaptation Layer
//!
//! Services the link core calls through narrow interfaces:
//! - Events and counting semaphores with tri-state timeouts
//! - Process identity tokens for ownership checks
//! - A generic memory service for user buffers
//! - Scoped reverse-order teardown for multi-step setup

pub mod mem;
pub mod prcs;
pub mod sync;
pub mod teardown;

pub use mem::{HeapMemory, MemoryService};
pub use prcs::{PrcsId, PrcsToken};
pub use sync::{Deadline, SyncEvent, SyncSemaphore, WaitResult};
pub use teardown::Teardown;
