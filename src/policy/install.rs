//! Policy installation.
//!
//! The whole policy crosses to the kernel in one request: a header
//! `{ count, entries }` pointing at `count` fixed-size entries
//! `{ kind, perms, value }`. Path values are NUL-terminated strings; network
//! values are [`RawNetRule`]s. Everything the request points at lives in a
//! [`WirePayload`] that is dropped when installation returns.

use super::netrule::{AddressFamily, NetEndpoint, NetRule, PortRange};
use super::rules::{Permissions, PolicyRule, RuleKind, RuleValue};
use crate::config::types::{PalError, Result};
use crate::kernel::host::{check, HostCalls};
use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[repr(C)]
#[derive(Debug)]
pub struct RawPolicy {
    pub count: u64,
    pub entries: *const RawPolicyEntry,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPolicyEntry {
    pub kind: u32,
    pub perms: u32,
    pub value: *const libc::c_void,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawNetEndpoint {
    pub addr: [u8; 16],
    pub begin: u16,
    pub end: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawNetRule {
    pub family: u32,
    pub local: RawNetEndpoint,
    pub peer: RawNetEndpoint,
}

pub const MONITOR_MAGIC: u8 = b'm';
pub const POLICY_INSTALL: u64 =
    nix::request_code_write!(MONITOR_MAGIC, 0, size_of::<RawPolicy>()) as u64;

impl RawNetEndpoint {
    fn from_endpoint(endpoint: &NetEndpoint) -> Self {
        let mut addr = [0u8; 16];
        match endpoint.addr {
            IpAddr::V4(v4) => addr[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => addr.copy_from_slice(&v6.octets()),
        }
        Self {
            addr,
            begin: endpoint.ports.begin,
            end: endpoint.ports.end,
        }
    }

    fn to_endpoint(self, family: AddressFamily) -> Result<NetEndpoint> {
        let addr = match family {
            AddressFamily::Inet => {
                IpAddr::V4(Ipv4Addr::new(self.addr[0], self.addr[1], self.addr[2], self.addr[3]))
            }
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
        };
        Ok(NetEndpoint {
            addr,
            ports: PortRange::new(self.begin, self.end)?,
        })
    }
}

impl From<&NetRule> for RawNetRule {
    fn from(rule: &NetRule) -> Self {
        Self {
            family: rule.family.raw(),
            local: RawNetEndpoint::from_endpoint(&rule.local),
            peer: RawNetEndpoint::from_endpoint(&rule.peer),
        }
    }
}

/// Staged request and every buffer it points into
#[derive(Debug)]
pub struct WirePayload {
    header: RawPolicy,
    entries: Vec<RawPolicyEntry>,
    _paths: Vec<CString>,
    _nets: Vec<Box<RawNetRule>>,
}

impl WirePayload {
    pub fn stage(rules: &[PolicyRule]) -> Result<Self> {
        let oom = |what: &str| PalError::NoMemory(format!("staging policy {}", what));
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(rules.len())
            .map_err(|_| oom("entries"))?;
        let mut paths = Vec::new();
        let mut nets = Vec::new();

        for rule in rules {
            let value = match &rule.value {
                RuleValue::Path(path) => {
                    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                        PalError::InvalidArgument(format!("path {} contains NUL", path.display()))
                    })?;
                    paths.try_reserve(1).map_err(|_| oom("paths"))?;
                    let ptr = path.as_ptr() as *const libc::c_void;
                    paths.push(path);
                    ptr
                }
                RuleValue::Net(net) => {
                    nets.try_reserve(1).map_err(|_| oom("network rules"))?;
                    let raw = Box::new(RawNetRule::from(net));
                    let ptr = &*raw as *const RawNetRule as *const libc::c_void;
                    nets.push(raw);
                    ptr
                }
            };
            entries.push(RawPolicyEntry {
                kind: rule.kind.wire(),
                perms: rule.perms.bits(),
                value,
            });
        }

        Ok(Self {
            header: RawPolicy {
                count: entries.len() as u64,
                entries: entries.as_ptr(),
            },
            entries,
            _paths: paths,
            _nets: nets,
        })
    }

    pub fn header(&self) -> &RawPolicy {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Rebuild rules from a request the way the enforcement point reads it.
///
/// # Safety
/// `raw` must describe a request built by [`WirePayload::stage`] whose
/// payload is still alive.
pub unsafe fn decode(raw: &RawPolicy) -> Result<Vec<PolicyRule>> {
    let entries = if raw.count == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(raw.entries, raw.count as usize)
    };
    entries
        .iter()
        .map(|entry| {
            let kind = RuleKind::from_wire(entry.kind).ok_or_else(|| {
                PalError::InvalidArgument(format!("rule kind {}", entry.kind))
            })?;
            let perms = Permissions::from_bits(entry.perms).ok_or_else(|| {
                PalError::InvalidArgument(format!("permission bits {:#x}", entry.perms))
            })?;
            let value = match kind {
                RuleKind::PathExact | RuleKind::PathRecursive => {
                    let bytes = CStr::from_ptr(entry.value as *const libc::c_char).to_bytes();
                    RuleValue::Path(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
                }
                RuleKind::NetRange => {
                    let raw = *(entry.value as *const RawNetRule);
                    let family = AddressFamily::from_raw(raw.family).ok_or_else(|| {
                        PalError::InvalidArgument(format!("address family {}", raw.family))
                    })?;
                    RuleValue::Net(NetRule {
                        family,
                        local: raw.local.to_endpoint(family)?,
                        peer: raw.peer.to_endpoint(family)?,
                    })
                }
            };
            Ok(PolicyRule { kind, perms, value })
        })
        .collect()
}

/// Privileged installation call
pub trait PolicyInstaller {
    fn install(&self, payload: &WirePayload) -> Result<()>;
}

/// Installs through the sandbox monitor device
pub struct MonitorInstaller {
    host: Arc<dyn HostCalls>,
    device: CString,
}

impl MonitorInstaller {
    pub fn new(host: Arc<dyn HostCalls>, device: &Path) -> Result<Self> {
        let device = CString::new(device.as_os_str().as_bytes()).map_err(|_| {
            PalError::InvalidArgument(format!("device path {} contains NUL", device.display()))
        })?;
        Ok(Self { host, device })
    }
}

impl PolicyInstaller for MonitorInstaller {
    fn install(&self, payload: &WirePayload) -> Result<()> {
        let fd = check(
            self.host.open(&self.device, libc::O_RDWR | libc::O_CLOEXEC),
            "open policy device",
        )?;
        let fd = i32::try_from(fd)
            .map_err(|_| PalError::InvalidArgument(format!("descriptor {} out of range", fd)))?;
        // SAFETY: the header and everything it points at live in `payload`
        // for the duration of the call.
        let ret = unsafe {
            self.host.ioctl(
                fd,
                POLICY_INSTALL,
                payload.header() as *const RawPolicy as *mut libc::c_void,
            )
        };
        let closed = check(self.host.close(fd), "close policy device");
        check(ret, "install policy")?;
        closed.map(|_| ())
    }
}

/// Stages the payload and installs nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunInstaller;

impl PolicyInstaller for DryRunInstaller {
    fn install(&self, payload: &WirePayload) -> Result<()> {
        log::warn!(
            "Dry run: {} policy entries staged, not installed",
            payload.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, MockHost};

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_install_request_code() {
        assert_eq!(POLICY_INSTALL, 0x4010_6d00);
    }

    fn sample_rules() -> Vec<PolicyRule> {
        vec![
            PolicyRule::path_exact("/lib/libc.so.6", Permissions::READ),
            PolicyRule::path_recursive("/tmp", Permissions::READ | Permissions::WRITE),
            PolicyRule::net(NetRule::parse("[::]:80-81:[2001:db8::1]:443").unwrap()),
        ]
    }

    #[test]
    fn test_stage_and_decode_preserves_rules() {
        let rules = sample_rules();
        let payload = WirePayload::stage(&rules).unwrap();
        assert_eq!(payload.header().count, 3);
        let decoded = unsafe { decode(payload.header()) }.unwrap();
        assert_eq!(decoded, rules);
    }

    #[test]
    fn test_net_value_layout() {
        let rule = NetRule::parse("10.0.0.1:80-81:10.0.0.2:443").unwrap();
        let raw = RawNetRule::from(&rule);
        assert_eq!(raw.family, libc::AF_INET as u32);
        assert_eq!(&raw.local.addr[..4], &[10, 0, 0, 1]);
        assert_eq!(&raw.local.addr[4..], &[0u8; 12]);
        assert_eq!((raw.local.begin, raw.local.end), (80, 81));
        assert_eq!((raw.peer.begin, raw.peer.end), (443, 443));
    }

    #[test]
    fn test_path_with_nul_is_rejected() {
        let rules = vec![PolicyRule::path_exact("/bad\0path", Permissions::READ)];
        assert!(WirePayload::stage(&rules).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_monitor_issues_single_request_and_closes() {
        let host = Arc::new(MockHost::new());
        host.script_open(77);
        host.push_ioctl(|request, arg| {
            assert_eq!(request, POLICY_INSTALL);
            // SAFETY: the installer passes a live RawPolicy.
            let header = unsafe { &*(arg as *const RawPolicy) };
            assert_eq!(header.count, 3);
            0
        });
        let installer =
            MonitorInstaller::new(host.clone(), Path::new("/dev/libos-monitor")).unwrap();
        let payload = WirePayload::stage(&sample_rules()).unwrap();
        installer.install(&payload).unwrap();

        let calls = host.calls();
        let ioctls = calls
            .iter()
            .filter(|c| matches!(c, HostCall::Ioctl { .. }))
            .count();
        assert_eq!(ioctls, 1);
        assert!(calls.contains(&HostCall::Close { fd: 77 }));
    }

    #[test]
    fn test_monitor_failure_still_closes_device() {
        let host = Arc::new(MockHost::new());
        host.script_open(78);
        host.push_ioctl(|_, _| -(libc::EPERM as isize));
        let installer =
            MonitorInstaller::new(host.clone(), Path::new("/dev/libos-monitor")).unwrap();
        let payload = WirePayload::stage(&sample_rules()).unwrap();
        let err = installer.install(&payload).unwrap_err();
        assert!(matches!(err, PalError::Denied(_)));
        assert!(host.calls().contains(&HostCall::Close { fd: 78 }));
    }
}
