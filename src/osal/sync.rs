//! Synchronization Primitives - Events and Counting Semaphores
//!
//! Blocking wait/wakeup for the link stack. Both primitives take the
//! tri-state [`Timeout`]: `NoWait` never blocks, `Forever` blocks until
//! woken, `Millis(n)` blocks for at most `n` milliseconds.
//!
//! Signalling never blocks for longer than the internal mutex hold time,
//! so `signal`/`post` are safe to call from the completion path.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{LinkError, LinkResult};
use crate::types::Timeout;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a wait operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Condition held (or became true) before the deadline
    Normal,
    /// Wait timed out
    TimedOut,
}

/// Absolute deadline derived from a [`Timeout`]
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn new(timeout: Timeout) -> Self {
        Self(timeout.duration().map(|d| Instant::now() + d))
    }

    /// Check whether a bounded deadline has passed
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the deadline; `NoWait` once it has passed
    pub fn remaining(&self) -> Timeout {
        let Some(at) = self.0 else {
            return Timeout::Forever;
        };
        let left = at.saturating_duration_since(Instant::now());
        match u32::try_from(left.as_millis()) {
            Ok(0) => Timeout::NoWait,
            Ok(ms) => Timeout::Millis(ms),
            Err(_) => Timeout::Millis(u32::MAX),
        }
    }

    /// Park on `cond` until notified or the deadline passes
    fn park<T>(&self, cond: &Condvar, guard: &mut parking_lot::MutexGuard<'_, T>) -> WaitResult {
        match self.0 {
            None => {
                cond.wait(guard);
                WaitResult::Normal
            }
            Some(at) => {
                if cond.wait_until(guard, at).timed_out() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Normal
                }
            }
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// Manual-reset event
///
/// Stays signalled until [`SyncEvent::reset`] is called; every waiter
/// observes the signalled state.
#[derive(Debug, Default)]
pub struct SyncEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Clear the event
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Wait for the event to become signalled
    pub fn wait(&self, timeout: Timeout) -> WaitResult {
        self.wait_until(Deadline::new(timeout))
    }

    /// Wait once; a spurious wakeup may return `Normal` with the event clear
    pub fn wait_until(&self, deadline: Deadline) -> WaitResult {
        let mut signalled = self.signalled.lock();
        if *signalled {
            return WaitResult::Normal;
        }
        if deadline.expired() {
            return WaitResult::TimedOut;
        }
        let result = deadline.park(&self.cond, &mut signalled);
        if *signalled {
            WaitResult::Normal
        } else {
            result
        }
    }
}

// ============================================================================
// Counting Semaphore
// ============================================================================

/// Counting semaphore
#[derive(Debug, Default)]
pub struct SyncSemaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl SyncSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Release one unit and wake one waiter
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Take one unit, blocking according to `timeout`
    ///
    /// Fails with `Timeout` when nothing is available in time, including
    /// immediately for `NoWait`.
    pub fn wait(&self, timeout: Timeout) -> LinkResult<()> {
        let deadline = Deadline::new(timeout);
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }
            if deadline.expired() || deadline.park(&self.cond, &mut count) == WaitResult::TimedOut {
                // One last look: a post may have raced the timeout
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
                return Err(LinkError::Timeout);
            }
        }
    }

    pub fn count(&self) -> u32 {
        *self.count.lock()
    }
}
