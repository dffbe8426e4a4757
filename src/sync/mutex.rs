use super::{wait_on, wake, Deadline};
use crate::config::types::Result;
use crate::kernel::host::HostCalls;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Three-state futex lock (unlocked / locked / locked with waiters).
pub struct PalMutex {
    state: AtomicU32,
    host: Arc<dyn HostCalls>,
}

/// Releases the lock on drop
pub struct PalMutexGuard<'a> {
    mutex: &'a PalMutex,
}

impl PalMutex {
    pub fn new(host: Arc<dyn HostCalls>) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            host,
        }
    }

    pub fn try_lock(&self) -> Option<PalMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PalMutexGuard { mutex: self })
    }

    /// Acquire the lock, waiting at most `timeout` (`None` waits forever)
    pub fn lock(&self, timeout: Option<Duration>) -> Result<PalMutexGuard<'_>> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }

        let deadline = Deadline::after(timeout);
        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(PalMutexGuard { mutex: self });
            }
            wait_on(self.host.as_ref(), &self.state, CONTENDED, deadline)?;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            wake(self.host.as_ref(), &self.state, 1);
        }
    }
}

impl std::fmt::Debug for PalMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PalMutex")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for PalMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::PalError;
    use crate::kernel::LinuxHost;

    fn host() -> Arc<dyn HostCalls> {
        Arc::new(LinuxHost::new())
    }

    #[test]
    fn test_lock_unlock() {
        let mutex = PalMutex::new(host());
        {
            let _guard = mutex.lock(None).unwrap();
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let mutex = PalMutex::new(host());
        let _guard = mutex.lock(None).unwrap();
        let result = mutex.lock(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(PalError::TryAgain(_))));
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let mutex = Arc::new(PalMutex::new(host()));
        let counter = Arc::new(AtomicU32::new(0));
        let mut threads = Vec::new();

        for _ in 0..4 {
            let mutex = mutex.clone();
            let counter = counter.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = mutex.lock(None).unwrap();
                    // Non-atomic read-modify-write under the lock.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2000);
        assert!(!mutex.is_locked());
    }
}
