//! Channel driver speaking the kernel control codes on a device node.
//!
//! Each endpoint is one open descriptor on the device. `CREATE` returns a
//! fresh token through its argument, `JOIN` attaches a second descriptor to
//! an existing token, `SEND` and `RECV` carry the parallel-array requests
//! from [`super::wire`].

use super::wire::{self, RawCommit, RawMap};
use super::{ChannelDriver, ChannelToken, CommitFlags, Extent};
use crate::config::types::{PalError, Protection, Result};
use crate::kernel::host::{check, HostCalls};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

pub struct DeviceChannelDriver {
    host: Arc<dyn HostCalls>,
    device: CString,
}

impl DeviceChannelDriver {
    pub fn new(host: Arc<dyn HostCalls>, device: &Path) -> Result<Self> {
        let device = CString::new(device.as_os_str().as_bytes()).map_err(|_| {
            PalError::InvalidArgument(format!("device path {} contains NUL", device.display()))
        })?;
        Ok(Self { host, device })
    }

    fn open_port(&self) -> Result<i32> {
        let fd = check(
            self.host.open(&self.device, libc::O_RDWR | libc::O_CLOEXEC),
            "open channel device",
        )?;
        i32::try_from(fd)
            .map_err(|_| PalError::InvalidArgument(format!("descriptor {} out of range", fd)))
    }

    fn port_fd(port: u64) -> Result<i32> {
        i32::try_from(port)
            .map_err(|_| PalError::InvalidArgument(format!("port {} is not a descriptor", port)))
    }
}

impl ChannelDriver for DeviceChannelDriver {
    fn create(&self) -> Result<(ChannelToken, u64)> {
        let fd = self.open_port()?;
        let mut token: u64 = 0;
        // SAFETY: CREATE writes one u64 through the argument pointer.
        let ret = unsafe {
            self.host
                .ioctl(fd, wire::CREATE, &mut token as *mut u64 as *mut libc::c_void)
        };
        if let Err(e) = check(ret, "channel create") {
            self.host.close(fd);
            return Err(e);
        }
        Ok((ChannelToken(token), fd as u64))
    }

    fn join(&self, token: ChannelToken) -> Result<u64> {
        let fd = self.open_port()?;
        let mut raw = token.0;
        // SAFETY: JOIN reads one u64 through the argument pointer.
        let ret = unsafe {
            self.host
                .ioctl(fd, wire::JOIN, &mut raw as *mut u64 as *mut libc::c_void)
        };
        if let Err(e) = check(ret, "channel join") {
            self.host.close(fd);
            return Err(e);
        }
        Ok(fd as u64)
    }

    unsafe fn send(&self, port: u64, extents: &[Extent], flags: CommitFlags) -> Result<usize> {
        if flags != CommitFlags::NONE {
            return Err(PalError::InvalidArgument(format!(
                "unsupported commit flags {:#x}",
                flags.bits()
            )));
        }
        let fd = Self::port_fd(port)?;
        let addrs: Vec<u64> = extents.iter().map(|e| e.addr as u64).collect();
        let lens: Vec<u64> = extents.iter().map(|e| e.len as u64).collect();
        let mut request = RawCommit {
            entry_count: extents.len() as u64,
            addrs: addrs.as_ptr(),
            lens: lens.as_ptr(),
        };
        // SAFETY: the request and both arrays outlive the call; the caller
        // guarantees the extents are readable.
        let ret = self.host.ioctl(
            fd,
            wire::SEND,
            &mut request as *mut RawCommit as *mut libc::c_void,
        );
        check(ret, "channel send")
    }

    unsafe fn recv(&self, port: u64, extents: &mut [Extent], prots: &[Protection]) -> Result<usize> {
        let fd = Self::port_fd(port)?;
        let mut addrs: Vec<u64> = extents.iter().map(|e| e.addr as u64).collect();
        let mut lens: Vec<u64> = extents.iter().map(|e| e.len as u64).collect();
        let host_prots: Vec<u64> = prots.iter().map(|p| p.to_host() as u64).collect();
        let mut request = RawMap {
            entry_count: extents.len() as u64,
            addrs: addrs.as_mut_ptr(),
            lens: lens.as_mut_ptr(),
            prots: host_prots.as_ptr(),
        };
        // SAFETY: the request and its arrays outlive the call; the caller
        // owns every non-zero destination range.
        let ret = self.host.ioctl(
            fd,
            wire::RECV,
            &mut request as *mut RawMap as *mut libc::c_void,
        );
        let count = check(ret, "channel recv")?.min(extents.len());
        for (i, extent) in extents.iter_mut().take(count).enumerate() {
            extent.addr = addrs[i] as usize;
            extent.len = lens[i] as usize;
        }
        Ok(count)
    }

    fn close(&self, port: u64) {
        match Self::port_fd(port) {
            Ok(fd) => {
                if let Err(e) = check(self.host.close(fd), "close channel port") {
                    log::warn!("Failed to close channel port {}: {}", port, e);
                }
            }
            Err(e) => log::warn!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{commit, create_channel, join_channel, map};
    use crate::config::types::page_size;
    use crate::kernel::host::HostCalls;
    use crate::testing::{HostCall, MockHost};

    const FAKE_FD: isize = 900;

    fn mock() -> Arc<MockHost> {
        let host = Arc::new(MockHost::new());
        host.script_open(FAKE_FD);
        host
    }

    #[test]
    fn test_create_reads_token_from_kernel() {
        let host = mock();
        host.push_ioctl(|request, arg| {
            assert_eq!(request, wire::CREATE);
            // SAFETY: CREATE passes a u64 out-pointer.
            unsafe { *(arg as *mut u64) = 0x1234 };
            0
        });
        let driver = Arc::new(
            DeviceChannelDriver::new(host.clone() as Arc<dyn HostCalls>, Path::new("/dev/gipc"))
                .unwrap(),
        );
        let (handle, token) = create_channel(driver).unwrap();
        assert_eq!(token, ChannelToken(0x1234));
        drop(handle);
        assert!(host
            .calls()
            .contains(&HostCall::Close { fd: FAKE_FD as i32 }));
    }

    #[test]
    fn test_failed_join_closes_descriptor() {
        let host = mock();
        host.push_ioctl(|request, _| {
            assert_eq!(request, wire::JOIN);
            -(libc::ENOENT as isize)
        });
        let driver = Arc::new(
            DeviceChannelDriver::new(host.clone() as Arc<dyn HostCalls>, Path::new("/dev/gipc"))
                .unwrap(),
        );
        let err = join_channel(driver, ChannelToken(9)).unwrap_err();
        assert!(matches!(err, PalError::NotFound(_)));
        assert!(host
            .calls()
            .contains(&HostCall::Close { fd: FAKE_FD as i32 }));
    }

    #[test]
    fn test_send_and_recv_marshal_parallel_arrays() {
        let host = mock();
        let page = page_size();
        host.push_ioctl(|_, arg| {
            // SAFETY: CREATE passes a u64 out-pointer.
            unsafe { *(arg as *mut u64) = 1 };
            0
        });
        host.push_ioctl(move |request, arg| {
            assert_eq!(request, wire::SEND);
            // SAFETY: SEND passes a RawCommit whose arrays hold entry_count items.
            let req = unsafe { &*(arg as *const RawCommit) };
            assert_eq!(req.entry_count, 2);
            let lens = unsafe { std::slice::from_raw_parts(req.lens, 2) };
            assert_eq!(lens, &[page as u64, 2 * page as u64]);
            2
        });
        host.push_ioctl(move |request, arg| {
            assert_eq!(request, wire::RECV);
            // SAFETY: RECV passes a RawMap whose arrays hold entry_count items.
            let req = unsafe { &mut *(arg as *mut RawMap) };
            assert_eq!(req.entry_count, 3);
            unsafe {
                *req.addrs = 0x7000_0000;
                *req.lens = page as u64;
            }
            1
        });

        let driver = Arc::new(
            DeviceChannelDriver::new(host.clone() as Arc<dyn HostCalls>, Path::new("/dev/gipc"))
                .unwrap(),
        );
        let (handle, _) = create_channel(driver).unwrap();

        let sent = unsafe {
            commit(
                &handle,
                &[Extent::new(page, 1), Extent::new(4 * page, page + 1)],
                CommitFlags::NONE,
            )
        }
        .unwrap();
        assert_eq!(sent, 2);

        let mut out = [Extent::default(); 3];
        let prots = [Protection::READ; 3];
        let mapped = unsafe { map(&handle, &mut out, &prots) }.unwrap();
        assert_eq!(mapped, 1);
        assert_eq!(out[0], Extent::new(0x7000_0000, page));
        assert_eq!(out[1], Extent::default());
    }
}
