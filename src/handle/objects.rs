/// Descriptor-backed and process handle bodies
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

/// Body of file, pipe, device, directory and socket handles.
/// The descriptor is closed when the body drops.
#[derive(Debug)]
pub struct FdObject {
    fd: OwnedFd,
    path: Option<PathBuf>,
}

impl FdObject {
    pub fn new(fd: OwnedFd, path: Option<PathBuf>) -> Self {
        Self { fd, path }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Child process handle body
#[derive(Debug)]
pub struct ProcessObject {
    pid: i32,
    control: Option<OwnedFd>,
}

impl ProcessObject {
    pub fn new(pid: i32, control: Option<OwnedFd>) -> Self {
        Self { pid, control }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Stream used to talk to the child, if one was set up
    pub fn control_fd(&self) -> Option<RawFd> {
        self.control.as_ref().map(AsRawFd::as_raw_fd)
    }
}
