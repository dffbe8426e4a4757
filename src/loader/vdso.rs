//! Fast clock through the kernel vDSO, with host fallback.

use super::image::MappedImage;
use super::link_map::ImageKind;
use super::registry::LoaderRegistry;
use crate::config::types::Result;
use crate::kernel::host::{check, HostCalls, HostClock};
use std::sync::Arc;
use std::time::Duration;

pub const VDSO_NAME: &str = "linux-vdso.so.1";

fn clock_symbol() -> Option<&'static str> {
    if cfg!(target_arch = "x86_64") {
        Some("__vdso_clock_gettime")
    } else if cfg!(target_arch = "aarch64") {
        Some("__kernel_clock_gettime")
    } else {
        None
    }
}

type VdsoClockFn = unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> libc::c_int;

#[derive(Clone, Copy)]
pub struct FastClock {
    entry: VdsoClockFn,
}

impl FastClock {
    /// Clock entry point of the vDSO already in `registry`
    pub fn from_registry(registry: &LoaderRegistry) -> Option<Self> {
        let symbol = clock_symbol()?;
        let map = registry.maps().find(|map| map.kind() == ImageKind::Vdso)?;
        let addr = map.lookup(symbol)?;
        if !map.text().is_some_and(|text| text.contains(&addr)) {
            return None;
        }
        // SAFETY: `addr` is the kernel's exported clock_gettime entry inside
        // the vDSO text segment, which has this C signature.
        let entry = unsafe { std::mem::transmute::<usize, VdsoClockFn>(addr) };
        Some(FastClock { entry })
    }

    pub fn now(&self, clock: HostClock) -> Option<Duration> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer for the call.
        let rc = unsafe { (self.entry)(clock.raw(), &mut ts) };
        if rc != 0 {
            return None;
        }
        Some(Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32))
    }
}

impl std::fmt::Debug for FastClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FastClock({:#x})", self.entry as usize)
    }
}

/// Load the vDSO as a companion image. Any failure disables the fast path.
pub fn load_vdso(registry: &mut LoaderRegistry) -> Option<FastClock> {
    let Some(image) = MappedImage::vdso() else {
        log::debug!("No vDSO mapped; using host clock");
        return None;
    };
    registry.load_companion(VDSO_NAME, image, ImageKind::Vdso)?;
    let clock = FastClock::from_registry(registry);
    if clock.is_none() {
        log::debug!("vDSO has no usable clock entry; using host clock");
    }
    clock
}

/// Clock reads through the vDSO when available, the host call otherwise
#[derive(Clone)]
pub struct TimeSource {
    host: Arc<dyn HostCalls>,
    fast: Option<FastClock>,
}

impl TimeSource {
    pub fn new(host: Arc<dyn HostCalls>, fast: Option<FastClock>) -> Self {
        Self { host, fast }
    }

    pub fn has_fast_path(&self) -> bool {
        self.fast.is_some()
    }

    pub fn now(&self, clock: HostClock) -> Result<Duration> {
        if let Some(now) = self.fast.and_then(|fast| fast.now(clock)) {
            return Ok(now);
        }
        let mut now = Duration::ZERO;
        check(self.host.clock_gettime(clock, &mut now), "clock_gettime")?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::LinuxHost;
    use crate::loader::LoaderOptions;

    #[test]
    fn test_host_fallback_without_vdso() {
        let source = TimeSource::new(Arc::new(LinuxHost::new()), None);
        assert!(!source.has_fast_path());
        let a = source.now(HostClock::Monotonic).unwrap();
        let b = source.now(HostClock::Monotonic).unwrap();
        assert!(b >= a);
    }

    #[test]
    fn test_vdso_clock_agrees_with_host() {
        let host: Arc<dyn HostCalls> = Arc::new(LinuxHost::new());
        let mut registry = LoaderRegistry::new(host.clone(), LoaderOptions::default());
        // Kernels without a vDSO simply take the fallback path.
        let Some(fast) = load_vdso(&mut registry) else {
            return;
        };
        assert_eq!(registry.head().map(|m| m.kind()), Some(ImageKind::Vdso));
        let source = TimeSource::new(host.clone(), Some(fast));
        let fast_now = source.now(HostClock::Monotonic).unwrap();
        let mut host_now = Duration::ZERO;
        check(host.clock_gettime(HostClock::Monotonic, &mut host_now), "clock").unwrap();
        assert!(host_now >= fast_now);
        assert!(host_now - fast_now < Duration::from_secs(5));
    }
}
