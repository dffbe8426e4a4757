//! Recording host backend for tests.
//!
//! `MockHost` forwards memory and blocking primitives to [`LinuxHost`] so
//! real pages and real futex waits keep working, records every call, and lets
//! a test script the outcome of the calls that are awkward to provoke on a
//! live kernel: interrupted sleeps, signal delivery, device opens and
//! control requests.

use crate::config::types::Protection;
use crate::kernel::host::{HostCalls, HostClock, ThreadStart};
use crate::kernel::LinuxHost;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::sync::atomic::AtomicU32;
use std::sync::Mutex;
use std::time::Duration;

/// One recorded host call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    MapAnonymous { addr: usize, len: usize, prot: Protection },
    Unmap { addr: usize, len: usize },
    Protect { addr: usize, len: usize, prot: Protection },
    Nanosleep { request: Duration },
    SchedYield,
    Tgkill { tgid: i32, tid: i32, signal: i32 },
    Open { path: String, flags: i32 },
    Close { fd: i32 },
    Ioctl { fd: i32, request: u64 },
    CreateThread { stack_size: usize },
}

/// Scripted result of one `nanosleep`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// Return success immediately without sleeping
    Complete,
    /// Report an interruption after `elapsed` of the request
    InterruptedAfter(Duration),
    /// Fail with `-errno`
    Fail(i32),
}

type IoctlHandler = Box<dyn FnMut(u64, *mut libc::c_void) -> isize + Send>;

#[derive(Default)]
struct Script {
    sleeps: VecDeque<SleepOutcome>,
    ioctls: VecDeque<IoctlHandler>,
    open_fd: Option<isize>,
    tgkill_result: Option<isize>,
    create_thread_result: Option<isize>,
}

#[derive(Default)]
pub struct MockHost {
    inner: LinuxHost,
    calls: Mutex<Vec<HostCall>>,
    script: Mutex<Script>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn push_sleep(&self, outcome: SleepOutcome) {
        self.with_script(|s| s.sleeps.push_back(outcome));
    }

    /// Queue a handler for the next `ioctl`. Unscripted requests fail with `ENOTTY`.
    pub fn push_ioctl<F>(&self, handler: F)
    where
        F: FnMut(u64, *mut libc::c_void) -> isize + Send + 'static,
    {
        self.with_script(|s| s.ioctls.push_back(Box::new(handler)));
    }

    /// Make every `open` return `fd`; closing it is recorded but not forwarded
    pub fn script_open(&self, fd: isize) {
        self.with_script(|s| s.open_fd = Some(fd));
    }

    pub fn script_tgkill(&self, result: isize) {
        self.with_script(|s| s.tgkill_result = Some(result));
    }

    pub fn script_create_thread(&self, result: isize) {
        self.with_script(|s| s.create_thread_result = Some(result));
    }

    fn record(&self, call: HostCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn with_script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        match self.script.lock() {
            Ok(mut script) => f(&mut script),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl HostCalls for MockHost {
    fn map_anonymous(&self, addr: usize, len: usize, prot: Protection) -> isize {
        self.record(HostCall::MapAnonymous { addr, len, prot });
        self.inner.map_anonymous(addr, len, prot)
    }

    fn unmap(&self, addr: usize, len: usize) -> isize {
        self.record(HostCall::Unmap { addr, len });
        self.inner.unmap(addr, len)
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> isize {
        self.record(HostCall::Protect { addr, len, prot });
        self.inner.protect(addr, len, prot)
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> isize {
        self.inner.futex_wait(word, expected, timeout)
    }

    fn futex_wake(&self, word: &AtomicU32, count: u32) -> isize {
        self.inner.futex_wake(word, count)
    }

    fn nanosleep(&self, request: Duration, remaining: &mut Duration) -> isize {
        self.record(HostCall::Nanosleep { request });
        match self.with_script(|s| s.sleeps.pop_front()) {
            Some(SleepOutcome::Complete) => 0,
            Some(SleepOutcome::InterruptedAfter(elapsed)) => {
                *remaining = request.saturating_sub(elapsed);
                -(libc::EINTR as isize)
            }
            Some(SleepOutcome::Fail(errno)) => -(errno as isize),
            None => self.inner.nanosleep(request, remaining),
        }
    }

    fn sched_yield(&self) -> isize {
        self.record(HostCall::SchedYield);
        self.inner.sched_yield()
    }

    fn gettid(&self) -> isize {
        self.inner.gettid()
    }

    fn getpid(&self) -> isize {
        self.inner.getpid()
    }

    fn tgkill(&self, tgid: i32, tid: i32, signal: i32) -> isize {
        self.record(HostCall::Tgkill { tgid, tid, signal });
        match self.with_script(|s| s.tgkill_result) {
            Some(result) => result,
            None => self.inner.tgkill(tgid, tid, signal),
        }
    }

    fn clock_gettime(&self, clock: HostClock, now: &mut Duration) -> isize {
        self.inner.clock_gettime(clock, now)
    }

    fn open(&self, path: &CStr, flags: i32) -> isize {
        self.record(HostCall::Open {
            path: path.to_string_lossy().into_owned(),
            flags,
        });
        match self.with_script(|s| s.open_fd) {
            Some(fd) => fd,
            None => self.inner.open(path, flags),
        }
    }

    fn close(&self, fd: i32) -> isize {
        self.record(HostCall::Close { fd });
        match self.with_script(|s| s.open_fd) {
            Some(scripted) if scripted == fd as isize => 0,
            _ => self.inner.close(fd),
        }
    }

    unsafe fn ioctl(&self, fd: i32, request: u64, arg: *mut libc::c_void) -> isize {
        self.record(HostCall::Ioctl { fd, request });
        // Take the handler out first so it can run without the script lock.
        let handler = self.with_script(|s| s.ioctls.pop_front());
        match handler {
            Some(mut handler) => handler(request, arg),
            None => -(libc::ENOTTY as isize),
        }
    }

    fn create_thread(&self, stack_size: usize, start: ThreadStart) -> isize {
        self.record(HostCall::CreateThread { stack_size });
        match self.with_script(|s| s.create_thread_result) {
            Some(result) => result,
            None => self.inner.create_thread(stack_size, start),
        }
    }
}
