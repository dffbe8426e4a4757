//! In-process channel driver.
//!
//! Emulates the kernel-resident channel object: every token owns two FIFO
//! queues of page descriptors, one per direction. A descriptor records the
//! committing process, a presence bitmap over its pages, the source range
//! and a snapshot of the non-zero pages. Pages that were all zero at commit
//! time are recorded absent and come back as fresh zero pages.

use super::{ChannelDriver, ChannelToken, CommitFlags, Extent};
use crate::config::types::{page_size, PalError, Protection, Result};
use crate::kernel::host::{check, HostCalls};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One committed extent as queued for the paired endpoint
#[derive(Debug, Clone)]
pub struct PageDescriptor {
    pub owner: i32,
    /// Bit `i` set when page `i` carries data
    pub present: Vec<u64>,
    pub addr: usize,
    pub len: usize,
    /// Present pages, in page order
    pub data: Vec<u8>,
}

impl PageDescriptor {
    pub fn page_count(&self) -> usize {
        self.len / page_size()
    }

    pub fn is_present(&self, page: usize) -> bool {
        self.present
            .get(page / 64)
            .map(|word| word & (1 << (page % 64)) != 0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Creator,
    Joiner,
}

impl Side {
    fn outgoing(self) -> usize {
        match self {
            Side::Creator => 0,
            Side::Joiner => 1,
        }
    }

    fn incoming(self) -> usize {
        1 - self.outgoing()
    }
}

#[derive(Debug, Default)]
struct TokenState {
    queues: [VecDeque<PageDescriptor>; 2],
    joined: bool,
    open_ports: usize,
}

#[derive(Debug, Default)]
struct LoopbackState {
    tokens: HashMap<ChannelToken, TokenState>,
    ports: HashMap<u64, (ChannelToken, Side)>,
}

pub struct LoopbackDriver {
    host: Arc<dyn HostCalls>,
    state: Mutex<LoopbackState>,
    next_port: AtomicU64,
}

impl LoopbackDriver {
    pub fn new(host: Arc<dyn HostCalls>) -> Self {
        Self {
            host,
            state: Mutex::new(LoopbackState::default()),
            next_port: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoopbackState>> {
        self.state
            .lock()
            .map_err(|_| PalError::NoResource("loopback channel state poisoned".to_string()))
    }

    /// Descriptors queued on `token` in either direction
    pub fn pending(&self, token: ChannelToken) -> usize {
        self.lock()
            .map(|state| {
                state
                    .tokens
                    .get(&token)
                    .map(|t| t.queues.iter().map(VecDeque::len).sum())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn open_ports(&self) -> usize {
        self.lock().map(|state| state.ports.len()).unwrap_or(0)
    }

    fn snapshot(&self, owner: i32, extent: &Extent) -> PageDescriptor {
        let page = page_size();
        let pages = extent.len / page;
        let mut present = vec![0u64; pages.div_ceil(64)];
        let mut data = Vec::new();
        for i in 0..pages {
            // SAFETY: the caller of `send` guarantees the extent is readable.
            let bytes =
                unsafe { std::slice::from_raw_parts((extent.addr + i * page) as *const u8, page) };
            if bytes.iter().any(|&b| b != 0) {
                present[i / 64] |= 1 << (i % 64);
                data.extend_from_slice(bytes);
            }
        }
        PageDescriptor {
            owner,
            present,
            addr: extent.addr,
            len: extent.len,
            data,
        }
    }

    /// Place `desc` at `addr` (or a host-chosen address) and return the address
    unsafe fn materialize(&self, desc: &PageDescriptor, addr: usize, prot: Protection) -> Result<usize> {
        let base = check(
            self.host.map_anonymous(addr, desc.len, Protection::READ_WRITE),
            "map channel pages",
        )?;
        let page = page_size();
        let mut offset = 0;
        for i in 0..desc.page_count() {
            if desc.is_present(i) {
                std::ptr::copy_nonoverlapping(
                    desc.data.as_ptr().add(offset),
                    (base + i * page) as *mut u8,
                    page,
                );
                offset += page;
            }
        }
        check(self.host.protect(base, desc.len, prot), "protect channel pages")?;
        Ok(base)
    }
}

impl ChannelDriver for LoopbackDriver {
    fn create(&self) -> Result<(ChannelToken, u64)> {
        let mut state = self.lock()?;
        let token = loop {
            let candidate = ChannelToken(uuid::Uuid::new_v4().as_u64_pair().0);
            if !state.tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        state.tokens.insert(
            token,
            TokenState {
                open_ports: 1,
                ..TokenState::default()
            },
        );
        state.ports.insert(port, (token, Side::Creator));
        Ok((token, port))
    }

    fn join(&self, token: ChannelToken) -> Result<u64> {
        let mut state = self.lock()?;
        let entry = state
            .tokens
            .get_mut(&token)
            .ok_or_else(|| PalError::NotFound(format!("channel {}", token)))?;
        if entry.joined {
            return Err(PalError::NoResource(format!("channel {} already joined", token)));
        }
        entry.joined = true;
        entry.open_ports += 1;
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        state.ports.insert(port, (token, Side::Joiner));
        Ok(port)
    }

    unsafe fn send(&self, port: u64, extents: &[Extent], flags: CommitFlags) -> Result<usize> {
        if flags != CommitFlags::NONE {
            return Err(PalError::InvalidArgument(format!(
                "unsupported commit flags {:#x}",
                flags.bits()
            )));
        }
        let owner = self.host.getpid() as i32;
        // Snapshot before taking the lock; the request is queued as a whole.
        let descriptors: Vec<PageDescriptor> =
            extents.iter().map(|e| self.snapshot(owner, e)).collect();

        let mut state = self.lock()?;
        let (token, side) = *state
            .ports
            .get(&port)
            .ok_or_else(|| PalError::InvalidArgument(format!("unknown channel port {}", port)))?;
        let entry = state
            .tokens
            .get_mut(&token)
            .ok_or_else(|| PalError::NotFound(format!("channel {}", token)))?;
        let count = descriptors.len();
        entry.queues[side.outgoing()].extend(descriptors);
        Ok(count)
    }

    unsafe fn recv(&self, port: u64, extents: &mut [Extent], prots: &[Protection]) -> Result<usize> {
        let mut state = self.lock()?;
        let (token, side) = *state
            .ports
            .get(&port)
            .ok_or_else(|| PalError::InvalidArgument(format!("unknown channel port {}", port)))?;
        let entry = state
            .tokens
            .get_mut(&token)
            .ok_or_else(|| PalError::NotFound(format!("channel {}", token)))?;
        let queue = &mut entry.queues[side.incoming()];
        let count = extents.len().min(queue.len());

        for (extent, desc) in extents.iter().zip(queue.iter()).take(count) {
            if extent.len != 0 && extent.len != desc.len {
                return Err(PalError::InvalidArgument(format!(
                    "map length {:#x} does not match committed length {:#x}",
                    extent.len, desc.len
                )));
            }
        }

        for i in 0..count {
            let Some(desc) = queue.pop_front() else {
                return Ok(i);
            };
            match self.materialize(&desc, extents[i].addr, prots[i]) {
                Ok(base) => extents[i] = Extent::new(base, desc.len),
                Err(e) => {
                    queue.push_front(desc);
                    if i == 0 {
                        return Err(e);
                    }
                    log::warn!("Channel {} map stopped after {} extents: {}", token, i, e);
                    return Ok(i);
                }
            }
        }
        Ok(count)
    }

    fn close(&self, port: u64) {
        let Ok(mut state) = self.lock() else {
            log::warn!("Dropping close of channel port {}: state poisoned", port);
            return;
        };
        let Some((token, _)) = state.ports.remove(&port) else {
            log::warn!("Close of unknown channel port {}", port);
            return;
        };
        let release = match state.tokens.get_mut(&token) {
            Some(entry) => {
                entry.open_ports = entry.open_ports.saturating_sub(1);
                entry.open_ports == 0
            }
            None => false,
        };
        if release {
            state.tokens.remove(&token);
            log::debug!("Released channel {}", token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{commit, create_channel, join_channel, map};
    use crate::kernel::LinuxHost;

    fn driver() -> Arc<LoopbackDriver> {
        Arc::new(LoopbackDriver::new(Arc::new(LinuxHost::new())))
    }

    fn alloc_pages(host: &LinuxHost, pages: usize) -> usize {
        check(
            host.map_anonymous(0, pages * page_size(), Protection::READ_WRITE),
            "test alloc",
        )
        .unwrap()
    }

    #[test]
    fn test_second_joiner_is_rejected() {
        let driver = driver();
        let (_creator, token) = create_channel(driver.clone()).unwrap();
        let _joiner = join_channel(driver.clone(), token).unwrap();
        let err = join_channel(driver, token).unwrap_err();
        assert!(matches!(err, PalError::NoResource(_)));
    }

    #[test]
    fn test_unknown_token_is_not_found() {
        let err = join_channel(driver(), ChannelToken(42)).unwrap_err();
        assert!(matches!(err, PalError::NotFound(_)));
    }

    #[test]
    fn test_zero_pages_are_recorded_absent() {
        let host = LinuxHost::new();
        let page = page_size();
        let src = alloc_pages(&host, 3);
        unsafe { *((src + page) as *mut u8) = 0x5a };

        let desc = driver().snapshot(1, &Extent::new(src, 3 * page));
        assert!(!desc.is_present(0));
        assert!(desc.is_present(1));
        assert!(!desc.is_present(2));
        assert_eq!(desc.data.len(), page);
        host.unmap(src, 3 * page);
    }

    #[test]
    fn test_directions_are_independent() {
        let host = LinuxHost::new();
        let driver = driver();
        let (creator, token) = create_channel(driver.clone()).unwrap();
        let joiner = join_channel(driver.clone(), token).unwrap();
        let src = alloc_pages(&host, 1);

        unsafe { commit(&creator, &[Extent::new(src, page_size())], CommitFlags::NONE) }.unwrap();
        // The creator cannot consume its own commit.
        let mut out = [Extent::default()];
        assert_eq!(unsafe { map(&creator, &mut out, &[Protection::READ]) }.unwrap(), 0);
        assert_eq!(unsafe { map(&joiner, &mut out, &[Protection::READ]) }.unwrap(), 1);
        assert_ne!(out[0].addr, 0);
        host.unmap(out[0].addr, out[0].len);
        host.unmap(src, page_size());
    }

    #[test]
    fn test_token_state_released_with_last_port() {
        let driver = driver();
        let (creator, token) = create_channel(driver.clone()).unwrap();
        let joiner = join_channel(driver.clone(), token).unwrap();
        assert_eq!(driver.open_ports(), 2);
        drop(creator);
        drop(joiner);
        assert_eq!(driver.open_ports(), 0);
        assert!(matches!(
            join_channel(driver, token).unwrap_err(),
            PalError::NotFound(_)
        ));
    }
}
