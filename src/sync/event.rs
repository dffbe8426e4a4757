use super::{wait_on, wake, Deadline};
use crate::config::types::Result;
use crate::kernel::host::HostCalls;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Stays signaled until cleared; wakes every waiter
    Notification,
    /// Each successful wait consumes the signal; wakes one waiter
    Synchronization,
}

pub struct Event {
    signaled: AtomicU32,
    kind: EventKind,
    host: Arc<dyn HostCalls>,
}

impl Event {
    pub fn new(host: Arc<dyn HostCalls>, kind: EventKind, initially_set: bool) -> Self {
        Self {
            signaled: AtomicU32::new(initially_set as u32),
            kind,
            host,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn set(&self) {
        self.signaled.store(1, Ordering::Release);
        let count = match self.kind {
            EventKind::Notification => i32::MAX as u32,
            EventKind::Synchronization => 1,
        };
        wake(self.host.as_ref(), &self.signaled, count);
    }

    pub fn clear(&self) {
        self.signaled.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire) != 0
    }

    /// Wait for the event, at most `timeout`
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::after(timeout);
        loop {
            let ready = match self.kind {
                EventKind::Notification => self.is_set(),
                EventKind::Synchronization => self
                    .signaled
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok(),
            };
            if ready {
                return Ok(());
            }
            wait_on(self.host.as_ref(), &self.signaled, 0, deadline)?;
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("signaled", &self.is_set())
            .finish()
    }
}
