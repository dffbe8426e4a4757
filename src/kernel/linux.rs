/// Linux backend for the host call seam
/// All `unsafe` host interaction is concentrated here with explicit SAFETY comments.
use super::host::{last_errno, HostCalls, HostClock, ThreadStart};
use crate::config::types::Protection;
use std::ffi::CStr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Host calls issued directly against the Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

fn to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

fn from_timespec(ts: &libc::timespec) -> Duration {
    Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32)
}

fn syscall_result(rc: libc::c_long) -> isize {
    if rc < 0 {
        last_errno()
    } else {
        rc as isize
    }
}

impl HostCalls for LinuxHost {
    fn map_anonymous(&self, addr: usize, len: usize, prot: Protection) -> isize {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if addr != 0 {
            flags |= libc::MAP_FIXED;
        }
        // SAFETY: anonymous mapping; with MAP_FIXED the caller owns the range
        // being replaced (HostCalls contract).
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                prot.to_host(),
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            last_errno()
        } else {
            ptr as isize
        }
    }

    fn unmap(&self, addr: usize, len: usize) -> isize {
        // SAFETY: munmap validates the range; callers only pass ranges they mapped.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            last_errno()
        } else {
            0
        }
    }

    fn protect(&self, addr: usize, len: usize, prot: Protection) -> isize {
        // SAFETY: mprotect only changes page permissions; the kernel validates the range.
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.to_host()) };
        if rc != 0 {
            last_errno()
        } else {
            0
        }
    }

    fn futex_wait(&self, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> isize {
        let ts = timeout.map(to_timespec);
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        // SAFETY: `word` is a live AtomicU32 (same layout as u32); FUTEX_WAIT
        // only reads it. The timespec outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        syscall_result(rc)
    }

    fn futex_wake(&self, word: &AtomicU32, count: u32) -> isize {
        let count = count.min(i32::MAX as u32);
        // SAFETY: FUTEX_WAKE does not dereference `word` beyond address lookup.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
            )
        };
        syscall_result(rc)
    }

    fn nanosleep(&self, request: Duration, remaining: &mut Duration) -> isize {
        let req = to_timespec(request);
        let mut rem = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: both timespecs are valid for the duration of the call.
        let rc = unsafe { libc::nanosleep(&req, &mut rem) };
        if rc != 0 {
            let err = last_errno();
            *remaining = from_timespec(&rem);
            err
        } else {
            *remaining = Duration::ZERO;
            0
        }
    }

    fn sched_yield(&self) -> isize {
        // SAFETY: sched_yield has no arguments.
        let rc = unsafe { libc::sched_yield() };
        if rc != 0 {
            last_errno()
        } else {
            0
        }
    }

    fn gettid(&self) -> isize {
        // SAFETY: gettid cannot fail.
        syscall_result(unsafe { libc::syscall(libc::SYS_gettid) })
    }

    fn getpid(&self) -> isize {
        nix::unistd::getpid().as_raw() as isize
    }

    fn tgkill(&self, tgid: i32, tid: i32, signal: i32) -> isize {
        // SAFETY: tgkill takes plain integers; the kernel validates them.
        syscall_result(unsafe { libc::syscall(libc::SYS_tgkill, tgid, tid, signal) })
    }

    fn clock_gettime(&self, clock: HostClock, now: &mut Duration) -> isize {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: ts is a valid out-pointer.
        let rc = unsafe { libc::clock_gettime(clock.raw(), &mut ts) };
        if rc != 0 {
            return last_errno();
        }
        *now = from_timespec(&ts);
        0
    }

    fn open(&self, path: &CStr, flags: i32) -> isize {
        // SAFETY: path is NUL-terminated; O_CLOEXEC keeps the descriptor out of children.
        let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
        if fd < 0 {
            last_errno()
        } else {
            fd as isize
        }
    }

    fn close(&self, fd: i32) -> isize {
        match nix::unistd::close(fd) {
            Ok(()) => 0,
            Err(e) => -(e as i32 as isize),
        }
    }

    unsafe fn ioctl(&self, fd: i32, request: u64, arg: *mut libc::c_void) -> isize {
        // SAFETY: forwarded from the caller's contract on `arg`.
        let rc = libc::ioctl(fd, request as _, arg);
        if rc < 0 {
            last_errno()
        } else {
            rc as isize
        }
    }

    fn create_thread(&self, stack_size: usize, start: ThreadStart) -> isize {
        // The C runtime sets up the thread control block for the new thread;
        // a bare clone would leave Rust and libc thread-locals aliased with
        // the parent.
        match std::thread::Builder::new()
            .name("hostpal-thread".to_string())
            .stack_size(stack_size)
            .spawn(start)
        {
            Ok(_detached) => 0,
            Err(e) => -(e.raw_os_error().unwrap_or(libc::EAGAIN) as isize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::page_size;
    use crate::kernel::host::check;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_map_protect_unmap() {
        let host = LinuxHost::new();
        let len = page_size() * 2;
        let addr = check(host.map_anonymous(0, len, Protection::READ_WRITE), "mmap").unwrap();
        assert_ne!(addr, 0);
        assert!(check(host.protect(addr, page_size(), Protection::NONE), "mprotect").is_ok());
        assert!(check(host.unmap(addr, len), "munmap").is_ok());
    }

    #[test]
    fn test_futex_wait_returns_on_value_mismatch() {
        let host = LinuxHost::new();
        let word = AtomicU32::new(1);
        let rc = host.futex_wait(&word, 0, Some(Duration::from_millis(10)));
        assert_eq!(rc, -(libc::EAGAIN as isize));
    }

    #[test]
    fn test_futex_wait_times_out() {
        let host = LinuxHost::new();
        let word = AtomicU32::new(0);
        let rc = host.futex_wait(&word, 0, Some(Duration::from_millis(5)));
        assert_eq!(rc, -(libc::ETIMEDOUT as isize));
    }

    #[test]
    fn test_create_thread_runs_start() {
        let host = LinuxHost::new();
        let flag = Arc::new(AtomicU32::new(0));
        let child_flag = flag.clone();
        let rc = host.create_thread(
            64 * 1024,
            Box::new(move || {
                child_flag.store(1, Ordering::SeqCst);
                let _ = LinuxHost.futex_wake(&child_flag, 1);
            }),
        );
        assert_eq!(rc, 0);
        while flag.load(Ordering::SeqCst) == 0 {
            host.futex_wait(&flag, 0, Some(Duration::from_millis(50)));
        }
    }

    #[test]
    fn test_open_missing_device_is_not_found() {
        let host = LinuxHost::new();
        let path = std::ffi::CString::new("/dev/hostpal-does-not-exist").unwrap();
        let err = check(host.open(&path, libc::O_RDWR), "open").unwrap_err();
        assert_eq!(err.code(), crate::config::types::code::NOT_FOUND);
    }

    #[test]
    fn test_clock_gettime_monotonic_advances() {
        let host = LinuxHost::new();
        let mut a = Duration::ZERO;
        let mut b = Duration::ZERO;
        assert_eq!(host.clock_gettime(HostClock::Monotonic, &mut a), 0);
        assert_eq!(host.clock_gettime(HostClock::Monotonic, &mut b), 0);
        assert!(b >= a);
    }
}
