use super::{wait_on, wake, Deadline};
use crate::config::types::{PalError, Result};
use crate::kernel::host::HostCalls;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counting semaphore bounded by `max`.
pub struct Semaphore {
    count: AtomicU32,
    max: u32,
    waiters: AtomicU32,
    host: Arc<dyn HostCalls>,
}

impl Semaphore {
    pub fn new(host: Arc<dyn HostCalls>, initial: u32, max: u32) -> Result<Self> {
        if max == 0 || initial > max {
            return Err(PalError::InvalidArgument(format!(
                "semaphore initial count {} exceeds maximum {}",
                initial, max
            )));
        }
        Ok(Self {
            count: AtomicU32::new(initial),
            max,
            waiters: AtomicU32::new(0),
            host,
        })
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Take one unit, waiting at most `timeout`
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            let waited = wait_on(self.host.as_ref(), &self.count, 0, deadline);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            waited?;
        }
    }

    /// Return `units` to the semaphore; returns the previous count
    pub fn release(&self, units: u32) -> Result<u32> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(units)
                .filter(|n| *n <= self.max)
                .ok_or_else(|| {
                    PalError::InvalidArgument(format!(
                        "releasing {} units would exceed maximum {}",
                        units, self.max
                    ))
                })?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if self.waiters.load(Ordering::SeqCst) > 0 {
            wake(self.host.as_ref(), &self.count, units);
        }
        Ok(current)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("max", &self.max)
            .finish()
    }
}
