//! Synchronization primitives built on one atomic word plus the host
//! wait-on-address call.
//!
//! No primitive spins indefinitely: every contended path blocks in
//! [`HostCalls::futex_wait`], and every wait takes an explicit timeout.

mod event;
mod mutex;
mod semaphore;

pub use event::{Event, EventKind};
pub use mutex::{PalMutex, PalMutexGuard};
pub use semaphore::Semaphore;

use crate::config::types::{PalError, Result};
use crate::kernel::host::{check, HostCalls};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Absolute expiry computed once from a caller timeout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    pub(crate) fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Time left, `None` when waiting forever
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Block while `*word == expected`.
///
/// Returns `Ok` when woken, when the value already changed, or on a spurious
/// interruption; callers re-check their condition in a loop. Returns
/// `TryAgain` once the deadline has passed with the word still at `expected`.
pub(crate) fn wait_on(
    host: &dyn HostCalls,
    word: &AtomicU32,
    expected: u32,
    deadline: Deadline,
) -> Result<()> {
    if deadline.expired() {
        return timed_out(word, expected, "wait timed out".to_string());
    }
    match check(host.futex_wait(word, expected, deadline.remaining()), "futex wait") {
        Ok(_) => Ok(()),
        Err(PalError::Interrupted { .. }) => Ok(()),
        Err(PalError::TryAgain(msg)) => {
            if deadline.expired() {
                timed_out(word, expected, msg)
            } else {
                Ok(())
            }
        }
        Err(e) => Err(e),
    }
}

/// A change that raced the deadline still gets one more look by the caller
fn timed_out(word: &AtomicU32, expected: u32, msg: String) -> Result<()> {
    if word.load(Ordering::Acquire) != expected {
        return Ok(());
    }
    Err(PalError::TryAgain(msg))
}

pub(crate) fn wake(host: &dyn HostCalls, word: &AtomicU32, count: u32) {
    if let Err(e) = check(host.futex_wake(word, count), "futex wake") {
        log::warn!("Failed to wake waiters: {}", e);
    }
}
