//! The host call seam.
//!
//! Every primitive the core needs from the host kernel goes through
//! [`HostCalls`]. Each method returns a signed result: non-negative on
//! success, `-errno` on failure. Backends implement the calling convention;
//! the core only ever sees the signed result and translates failures with
//! [`check`].

use crate::config::types::{PalError, Protection, Result};
use nix::errno::Errno;
use std::ffi::CStr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Work item handed to [`HostCalls::create_thread`]
pub type ThreadStart = Box<dyn FnOnce() + Send + 'static>;

/// Clock identifiers understood by [`HostCalls::clock_gettime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClock {
    Realtime,
    Monotonic,
}

impl HostClock {
    pub fn raw(self) -> libc::clockid_t {
        match self {
            HostClock::Realtime => libc::CLOCK_REALTIME,
            HostClock::Monotonic => libc::CLOCK_MONOTONIC,
        }
    }
}

pub trait HostCalls: Send + Sync {
    /// Map anonymous private memory. `addr == 0` lets the host choose;
    /// otherwise the mapping is placed exactly at `addr`.
    fn map_anonymous(&self, addr: usize, len: usize, prot: Protection) -> isize;

    fn unmap(&self, addr: usize, len: usize) -> isize;

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> isize;

    /// Block while `*word == expected`, up to `timeout`
    fn futex_wait(&self, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> isize;

    /// Wake up to `count` waiters blocked on `word`
    fn futex_wake(&self, word: &AtomicU32, count: u32) -> isize;

    /// Sleep for `request`; on interruption `remaining` receives the unslept time
    fn nanosleep(&self, request: Duration, remaining: &mut Duration) -> isize;

    fn sched_yield(&self) -> isize;

    fn gettid(&self) -> isize;

    fn getpid(&self) -> isize;

    fn tgkill(&self, tgid: i32, tid: i32, signal: i32) -> isize;

    fn clock_gettime(&self, clock: HostClock, now: &mut Duration) -> isize;

    fn open(&self, path: &CStr, flags: i32) -> isize;

    fn close(&self, fd: i32) -> isize;

    /// Issue a control request against `fd`.
    ///
    /// # Safety
    /// `arg` must point to the structure `request` encodes, valid for the
    /// duration of the call, including every pointer reachable from it.
    unsafe fn ioctl(&self, fd: i32, request: u64, arg: *mut libc::c_void) -> isize;

    /// Start a thread of control sharing the caller's address space with a
    /// stack of `stack_size` bytes. Returns 0 on success.
    fn create_thread(&self, stack_size: usize, start: ThreadStart) -> isize;
}

/// Translate a signed host result into the error taxonomy.
pub fn check(ret: isize, context: &str) -> Result<usize> {
    if ret >= 0 {
        return Ok(ret as usize);
    }
    let errno = i32::try_from(-ret).unwrap_or(libc::EINVAL);
    Err(translate_errno(Errno::from_raw(errno), context))
}

pub fn translate_errno(errno: Errno, context: &str) -> PalError {
    let msg = format!("{}: {}", context, errno.desc());
    match errno {
        Errno::EINVAL | Errno::EFAULT | Errno::EBADF | Errno::ENOTTY | Errno::E2BIG => {
            PalError::InvalidArgument(msg)
        }
        Errno::ENOMEM => PalError::NoMemory(msg),
        Errno::EPERM | Errno::EACCES => PalError::Denied(msg),
        Errno::EINTR => PalError::Interrupted {
            remaining: Duration::ZERO,
        },
        Errno::ENOENT | Errno::ENODEV | Errno::ENXIO | Errno::ESRCH => PalError::NotFound(msg),
        Errno::EMFILE | Errno::ENFILE | Errno::ENOSPC | Errno::EBUSY => PalError::NoResource(msg),
        Errno::EAGAIN | Errno::ETIMEDOUT => PalError::TryAgain(msg),
        _ => PalError::Denied(msg),
    }
}

/// Negative errno from the calling thread's last libc failure
pub(crate) fn last_errno() -> isize {
    -(std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL) as isize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_success_through() {
        assert_eq!(check(0, "noop").unwrap(), 0);
        assert_eq!(check(42, "noop").unwrap(), 42);
    }

    #[test]
    fn test_translation_table() {
        let cases: &[(i32, i32)] = &[
            (libc::EINVAL, crate::config::types::code::INVALID_ARGUMENT),
            (libc::ENOMEM, crate::config::types::code::NO_MEMORY),
            (libc::EPERM, crate::config::types::code::DENIED),
            (libc::EACCES, crate::config::types::code::DENIED),
            (libc::EINTR, crate::config::types::code::INTERRUPTED),
            (libc::ENOENT, crate::config::types::code::NOT_FOUND),
            (libc::ENODEV, crate::config::types::code::NOT_FOUND),
            (libc::EMFILE, crate::config::types::code::NO_RESOURCE),
            (libc::EAGAIN, crate::config::types::code::TRY_AGAIN),
            (libc::ETIMEDOUT, crate::config::types::code::TRY_AGAIN),
            (libc::EXDEV, crate::config::types::code::DENIED),
        ];
        for (errno, expected) in cases {
            let err = check(-(*errno as isize), "case").unwrap_err();
            assert_eq!(err.code(), *expected, "errno {}", errno);
        }
    }
}
