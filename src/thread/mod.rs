//! Threads of control.
//!
//! A spawned thread runs its entry inside a trampoline that records the host
//! thread id, catches [`exit_thread`] and publishes the exit code through the
//! thread handle. The handle keeps the [`ThreadObject`] alive for as long as
//! either the caller or the running thread holds a reference.

use crate::config::types::{align_up, page_size, PalError, Result};
use crate::handle::{Handle, HandleBody};
use crate::kernel::host::{check, HostCalls, ThreadStart};
use crate::sync::{Event, EventKind};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default stack reserved for threads created through [`spawn`]
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Spawn options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadFlags(u32);

impl ThreadFlags {
    pub const NONE: ThreadFlags = ThreadFlags(0);
    /// Nobody waits for the exit code; [`ThreadObject::wait_exit`] refuses
    pub const DETACHED: ThreadFlags = ThreadFlags(1 << 0);

    const ALL: u32 = Self::DETACHED.0;

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(PalError::InvalidArgument(format!(
                "unknown thread flags {:#x}",
                bits & !Self::ALL
            )));
        }
        Ok(ThreadFlags(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ThreadFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Unwind payload carried by [`exit_thread`]
struct ThreadExit(i32);

/// Exit code recorded for a thread whose entry panicked
pub const PANIC_EXIT_CODE: i32 = -1;

/// Body of thread handles
pub struct ThreadObject {
    host: Arc<dyn HostCalls>,
    tgid: i32,
    tid: AtomicI32,
    flags: ThreadFlags,
    exit_code: AtomicI32,
    started: Event,
    exited: Event,
}

impl ThreadObject {
    fn new(host: Arc<dyn HostCalls>, flags: ThreadFlags) -> Self {
        let tgid = host.getpid() as i32;
        Self {
            started: Event::new(host.clone(), EventKind::Notification, false),
            exited: Event::new(host.clone(), EventKind::Notification, false),
            host,
            tgid,
            tid: AtomicI32::new(0),
            flags,
            exit_code: AtomicI32::new(0),
        }
    }

    /// Host thread id, once the thread is running
    pub fn tid(&self) -> Option<i32> {
        match self.tid.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_set()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.has_exited()
            .then(|| self.exit_code.load(Ordering::Acquire))
    }

    /// Wait until the thread has recorded its tid
    pub fn wait_started(&self, timeout: Option<Duration>) -> Result<i32> {
        self.started.wait(timeout)?;
        self.tid()
            .ok_or_else(|| PalError::NotFound("thread id not recorded".to_string()))
    }

    /// Wait for the thread to finish and return its exit code
    pub fn wait_exit(&self, timeout: Option<Duration>) -> Result<i32> {
        if self.flags.contains(ThreadFlags::DETACHED) {
            return Err(PalError::InvalidArgument(
                "cannot wait for a detached thread".to_string(),
            ));
        }
        self.exited.wait(timeout)?;
        Ok(self.exit_code.load(Ordering::Acquire))
    }
}

impl std::fmt::Debug for ThreadObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadObject")
            .field("tgid", &self.tgid)
            .field("tid", &self.tid())
            .field("flags", &self.flags)
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

fn run_thread<F>(handle: Handle, entry: F)
where
    F: FnOnce() -> i32,
{
    let Ok(thread) = handle.as_thread() else {
        return;
    };
    thread
        .tid
        .store(thread.host.gettid() as i32, Ordering::Release);
    thread.started.set();

    let code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.0,
            Err(_) => {
                log::error!("Thread {:?} panicked", thread.tid());
                PANIC_EXIT_CODE
            }
        },
    };

    thread.exit_code.store(code, Ordering::Release);
    thread.exited.set();
    log::debug!("Thread {:?} exited with {}", thread.tid(), code);
}

fn stack_size_for(requested: usize) -> Result<usize> {
    if requested == 0 {
        return Err(PalError::InvalidArgument("zero thread stack size".to_string()));
    }
    align_up(requested, page_size())
        .ok_or_else(|| PalError::NoMemory(format!("stack of {} bytes", requested)))
}

/// Start `entry` on a new thread sharing this address space.
///
/// `stack_size` is rounded up to the page size. Host refusal is reported as
/// `Denied`, stack exhaustion as `NoMemory`.
pub fn spawn<F>(
    host: Arc<dyn HostCalls>,
    entry: F,
    flags: ThreadFlags,
    stack_size: usize,
) -> Result<Handle>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let stack_size = stack_size_for(stack_size)?;
    let handle = Handle::from_body(HandleBody::Thread(ThreadObject::new(host.clone(), flags)));
    let child = handle.clone();
    let start: ThreadStart = Box::new(move || run_thread(child, entry));

    match check(host.create_thread(stack_size, start), "create thread") {
        Ok(_) => Ok(handle),
        Err(PalError::NoMemory(msg)) => Err(PalError::NoMemory(msg)),
        Err(e) => Err(PalError::Denied(e.to_string())),
    }
}

/// Sleep for `duration`.
///
/// An interrupted sleep returns `Interrupted` carrying the part of the
/// request that did not elapse.
pub fn delay(host: &dyn HostCalls, duration: Duration) -> Result<()> {
    let mut remaining = Duration::ZERO;
    match check(host.nanosleep(duration, &mut remaining), "delay") {
        Ok(_) => Ok(()),
        Err(PalError::Interrupted { .. }) => Err(PalError::Interrupted { remaining }),
        Err(e) => Err(e),
    }
}

pub fn yield_execution(host: &dyn HostCalls) -> Result<()> {
    check(host.sched_yield(), "yield").map(|_| ())
}

/// Leave the current spawned thread with `code`.
///
/// Unwinds to the trampoline installed by [`spawn`], running destructors on
/// the way. Only valid on threads started by [`spawn`].
pub fn exit_thread(code: i32) -> ! {
    panic::resume_unwind(Box::new(ThreadExit(code)))
}

/// Continue a stopped thread
pub fn resume(host: &dyn HostCalls, handle: &Handle) -> Result<()> {
    let thread = handle.as_thread()?;
    let tid = thread
        .tid()
        .ok_or_else(|| PalError::Denied("thread has not started".to_string()))?;
    check(host.tgkill(thread.tgid, tid, libc::SIGCONT), "resume thread")
        .map(|_| ())
        .map_err(|e| PalError::Denied(e.to_string()))
}

thread_local! {
    static PRIVATE_AREA: Cell<usize> = const { Cell::new(0) };
}

/// Per-thread private word, zero until set
pub fn private_area() -> usize {
    PRIVATE_AREA.with(Cell::get)
}

pub fn set_private_area(value: usize) {
    PRIVATE_AREA.with(|area| area.set(value));
}
