//! Handle registry.
//!
//! Every resource the runtime exposes is a [`Handle`]: a reference-counted
//! object with a common header (`kind`, `flags`) and a kind-specific body.
//! Cloning a handle retains it; dropping the last clone runs the body's
//! teardown synchronously, exactly once.
//!
//! Kind-specific operations go through the typed accessors (`as_channel`,
//! `as_thread`, ...), which fail with `InvalidArgument` on a kind mismatch
//! before touching the body.

mod objects;

pub use objects::{FdObject, ProcessObject};

use crate::channel::ChannelEndpoint;
use crate::config::types::{PalError, Result};
use crate::sync::{Event, PalMutex, Semaphore};
use crate::thread::ThreadObject;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    File,
    Pipe,
    Device,
    Directory,
    Channel,
    Socket,
    Process,
    Thread,
    Semaphore,
    Event,
    Mutex,
}

impl HandleKind {
    /// Kinds whose body is a host file descriptor
    pub fn is_fd_backed(self) -> bool {
        matches!(
            self,
            HandleKind::File
                | HandleKind::Pipe
                | HandleKind::Device
                | HandleKind::Directory
                | HandleKind::Socket
        )
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::File => "file",
            HandleKind::Pipe => "pipe",
            HandleKind::Device => "device",
            HandleKind::Directory => "directory",
            HandleKind::Channel => "channel",
            HandleKind::Socket => "socket",
            HandleKind::Process => "process",
            HandleKind::Thread => "thread",
            HandleKind::Semaphore => "semaphore",
            HandleKind::Event => "event",
            HandleKind::Mutex => "mutex",
        };
        write!(f, "{}", name)
    }
}

/// Handle status flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleFlags(u32);

impl HandleFlags {
    pub const NONE: HandleFlags = HandleFlags(0);
    pub const READABLE: HandleFlags = HandleFlags(1 << 0);
    pub const WRITABLE: HandleFlags = HandleFlags(1 << 1);
    pub const ERROR: HandleFlags = HandleFlags(1 << 2);
    pub const NONBLOCK: HandleFlags = HandleFlags(1 << 3);

    pub fn contains(&self, other: HandleFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for HandleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        HandleFlags(self.0 | rhs.0)
    }
}

/// Kind-specific part of a handle
pub enum HandleBody {
    File(FdObject),
    Pipe(FdObject),
    Device(FdObject),
    Directory(FdObject),
    Socket(FdObject),
    Channel(ChannelEndpoint),
    Process(ProcessObject),
    Thread(ThreadObject),
    Semaphore(Semaphore),
    Event(Event),
    Mutex(PalMutex),
}

impl HandleBody {
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleBody::File(_) => HandleKind::File,
            HandleBody::Pipe(_) => HandleKind::Pipe,
            HandleBody::Device(_) => HandleKind::Device,
            HandleBody::Directory(_) => HandleKind::Directory,
            HandleBody::Socket(_) => HandleKind::Socket,
            HandleBody::Channel(_) => HandleKind::Channel,
            HandleBody::Process(_) => HandleKind::Process,
            HandleBody::Thread(_) => HandleKind::Thread,
            HandleBody::Semaphore(_) => HandleKind::Semaphore,
            HandleBody::Event(_) => HandleKind::Event,
            HandleBody::Mutex(_) => HandleKind::Mutex,
        }
    }
}

struct HandleHeader {
    kind: HandleKind,
    flags: AtomicU32,
}

struct HandleInner {
    header: HandleHeader,
    body: HandleBody,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Body fields release their host resources as they drop, right here,
        // before the storage goes away.
        log::debug!("Tearing down {} handle", self.header.kind);
    }
}

/// Reference-counted resource handle.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

fn mismatch(expected: HandleKind, actual: HandleKind) -> PalError {
    PalError::InvalidArgument(format!(
        "expected a {} handle, got a {} handle",
        expected, actual
    ))
}

impl Handle {
    /// Create a handle of `kind`. The constructor fills in the body; the
    /// header starts with empty flags and the caller holds the first reference.
    pub fn create<F>(kind: HandleKind, construct: F) -> Result<Handle>
    where
        F: FnOnce() -> Result<HandleBody>,
    {
        let body = construct()?;
        if body.kind() != kind {
            return Err(mismatch(kind, body.kind()));
        }
        Ok(Self::from_body(body))
    }

    pub fn from_body(body: HandleBody) -> Handle {
        let kind = body.kind();
        log::debug!("Created {} handle", kind);
        Handle {
            inner: Arc::new(HandleInner {
                header: HandleHeader {
                    kind,
                    flags: AtomicU32::new(0),
                },
                body,
            }),
        }
    }

    /// Wrap an owned descriptor as an fd-backed handle of `kind`
    pub fn from_fd(kind: HandleKind, object: FdObject) -> Result<Handle> {
        let body = match kind {
            HandleKind::File => HandleBody::File(object),
            HandleKind::Pipe => HandleBody::Pipe(object),
            HandleKind::Device => HandleBody::Device(object),
            HandleKind::Directory => HandleBody::Directory(object),
            HandleKind::Socket => HandleBody::Socket(object),
            other => {
                return Err(PalError::InvalidArgument(format!(
                    "{} handles are not descriptor-backed",
                    other
                )))
            }
        };
        Ok(Self::from_body(body))
    }

    pub fn kind(&self) -> HandleKind {
        self.inner.header.kind
    }

    pub fn is_kind(&self, kind: HandleKind) -> bool {
        self.inner.header.kind == kind
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags(self.inner.header.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: HandleFlags) {
        self.inner.header.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: HandleFlags) {
        self.inner
            .header
            .flags
            .fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Take another reference
    pub fn retain(&self) -> Handle {
        self.clone()
    }

    /// Drop this reference; the last release tears the object down
    pub fn release(self) {
        drop(self)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether two handles reference the same object
    pub fn same_object(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn as_channel(&self) -> Result<&ChannelEndpoint> {
        match &self.inner.body {
            HandleBody::Channel(endpoint) => Ok(endpoint),
            other => Err(mismatch(HandleKind::Channel, other.kind())),
        }
    }

    pub fn as_thread(&self) -> Result<&ThreadObject> {
        match &self.inner.body {
            HandleBody::Thread(thread) => Ok(thread),
            other => Err(mismatch(HandleKind::Thread, other.kind())),
        }
    }

    pub fn as_process(&self) -> Result<&ProcessObject> {
        match &self.inner.body {
            HandleBody::Process(process) => Ok(process),
            other => Err(mismatch(HandleKind::Process, other.kind())),
        }
    }

    pub fn as_event(&self) -> Result<&Event> {
        match &self.inner.body {
            HandleBody::Event(event) => Ok(event),
            other => Err(mismatch(HandleKind::Event, other.kind())),
        }
    }

    pub fn as_semaphore(&self) -> Result<&Semaphore> {
        match &self.inner.body {
            HandleBody::Semaphore(sem) => Ok(sem),
            other => Err(mismatch(HandleKind::Semaphore, other.kind())),
        }
    }

    pub fn as_mutex(&self) -> Result<&PalMutex> {
        match &self.inner.body {
            HandleBody::Mutex(mutex) => Ok(mutex),
            other => Err(mismatch(HandleKind::Mutex, other.kind())),
        }
    }

    pub fn as_fd_object(&self) -> Result<&FdObject> {
        match &self.inner.body {
            HandleBody::File(obj)
            | HandleBody::Pipe(obj)
            | HandleBody::Device(obj)
            | HandleBody::Directory(obj)
            | HandleBody::Socket(obj) => Ok(obj),
            other => Err(PalError::InvalidArgument(format!(
                "{} handles have no host descriptor",
                other.kind()
            ))),
        }
    }

    pub fn as_raw_fd(&self) -> Result<RawFd> {
        self.as_fd_object().map(FdObject::raw_fd)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}
