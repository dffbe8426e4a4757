//! Physical memory channel.
//!
//! A channel is a kernel-resident queue of page descriptors identified by a
//! [`ChannelToken`]. The creator and one joiner each hold a channel handle
//! for the same token. `commit` enqueues page extents from one endpoint;
//! `map` on the paired endpoint dequeues them in commit order and
//! materializes the same contents at the requested addresses.
//!
//! A short `map` count is a complete result: the queue held fewer
//! descriptors than requested. Whether to retry for the remainder is up to
//! the caller.

pub mod device;
pub mod loopback;
pub mod wire;

pub use device::DeviceChannelDriver;
pub use loopback::LoopbackDriver;

use crate::config::types::{align_up, is_page_aligned, page_size, PalError, Protection, Result};
use crate::handle::{Handle, HandleBody};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One page range: start address and length in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub addr: usize,
    pub len: usize,
}

impl Extent {
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }
}

/// Commit request flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(u32);

impl CommitFlags {
    pub const NONE: CommitFlags = CommitFlags(0);

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits == 0 {
            Some(CommitFlags(bits))
        } else {
            None
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Shared secret naming a channel's kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelToken(pub u64);

impl fmt::Display for ChannelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    Creator,
    Joiner,
}

/// Backend owning the kernel-resident channel objects.
///
/// Ports are driver-chosen endpoint identifiers (a descriptor for the device
/// driver). Every port returned by `create`/`join` is passed to `close`
/// exactly once.
pub trait ChannelDriver: Send + Sync {
    fn create(&self) -> Result<(ChannelToken, u64)>;

    fn join(&self, token: ChannelToken) -> Result<u64>;

    /// Enqueue `extents` for the paired endpoint. Lengths are page multiples
    /// and addresses page aligned. Returns the number of extents accepted.
    ///
    /// # Safety
    /// Every extent must be readable memory for its whole length.
    unsafe fn send(&self, port: u64, extents: &[Extent], flags: CommitFlags) -> Result<usize>;

    /// Dequeue up to `extents.len()` descriptors and materialize them.
    /// A zero address lets the driver place the pages; the chosen address and
    /// the descriptor length are written back. Returns the number mapped.
    ///
    /// # Safety
    /// Every non-zero destination range must be owned by the caller and free
    /// to be replaced.
    unsafe fn recv(&self, port: u64, extents: &mut [Extent], prots: &[Protection])
        -> Result<usize>;

    fn close(&self, port: u64);
}

/// Body of a channel handle. Closing the port is its teardown.
pub struct ChannelEndpoint {
    driver: Arc<dyn ChannelDriver>,
    token: ChannelToken,
    port: u64,
    role: ChannelRole,
}

impl ChannelEndpoint {
    pub fn token(&self) -> ChannelToken {
        self.token
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn port(&self) -> u64 {
        self.port
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        log::debug!("Closing channel {} port {}", self.token, self.port);
        self.driver.close(self.port);
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("token", &self.token)
            .field("port", &self.port)
            .field("role", &self.role)
            .finish()
    }
}

/// Allocate a new channel. The token goes to the cooperating process out of band.
pub fn create_channel(driver: Arc<dyn ChannelDriver>) -> Result<(Handle, ChannelToken)> {
    let (token, port) = driver.create()?;
    log::debug!("Created channel {}", token);
    let endpoint = ChannelEndpoint {
        driver,
        token,
        port,
        role: ChannelRole::Creator,
    };
    Ok((Handle::from_body(HandleBody::Channel(endpoint)), token))
}

pub fn join_channel(driver: Arc<dyn ChannelDriver>, token: ChannelToken) -> Result<Handle> {
    let port = driver.join(token)?;
    log::debug!("Joined channel {}", token);
    let endpoint = ChannelEndpoint {
        driver,
        token,
        port,
        role: ChannelRole::Joiner,
    };
    Ok(Handle::from_body(HandleBody::Channel(endpoint)))
}

fn round_length(len: usize) -> Result<usize> {
    align_up(len, page_size())
        .ok_or_else(|| PalError::InvalidArgument(format!("extent length {:#x} overflows", len)))
}

/// Commit page extents on `channel`. Lengths are rounded up to the page size.
///
/// # Safety
/// Every extent must be readable memory for its rounded length.
pub unsafe fn commit(channel: &Handle, extents: &[Extent], flags: CommitFlags) -> Result<usize> {
    let endpoint = channel.as_channel()?;
    if extents.is_empty() {
        return Ok(0);
    }

    let mut request = Vec::with_capacity(extents.len());
    for extent in extents {
        if !is_page_aligned(extent.addr) {
            return Err(PalError::InvalidArgument(format!(
                "extent address {:#x} is not page aligned",
                extent.addr
            )));
        }
        if extent.len == 0 {
            return Err(PalError::InvalidArgument(format!(
                "zero-length extent at {:#x}",
                extent.addr
            )));
        }
        request.push(Extent::new(extent.addr, round_length(extent.len)?));
    }

    let count = endpoint.driver.send(endpoint.port, &request, flags)?;
    log::debug!("Committed {} extents on channel {}", count, endpoint.token);
    Ok(count)
}

/// Map previously committed extents from the paired endpoint.
///
/// `prots` must have one entry per extent. A zero address asks the driver to
/// choose; a zero length accepts whatever length was committed. Mapped
/// entries are updated in place with the final address and length. The
/// returned count may be smaller than `extents.len()`.
///
/// # Safety
/// Every non-zero destination range must be owned by the caller; its current
/// contents are replaced.
pub unsafe fn map(channel: &Handle, extents: &mut [Extent], prots: &[Protection]) -> Result<usize> {
    let endpoint = channel.as_channel()?;
    if prots.len() != extents.len() {
        return Err(PalError::InvalidArgument(format!(
            "{} protections for {} extents",
            prots.len(),
            extents.len()
        )));
    }
    if extents.is_empty() {
        return Ok(0);
    }

    for extent in extents.iter_mut() {
        if !is_page_aligned(extent.addr) {
            return Err(PalError::InvalidArgument(format!(
                "map address {:#x} is not page aligned",
                extent.addr
            )));
        }
        extent.len = round_length(extent.len)?;
    }

    let count = endpoint.driver.recv(endpoint.port, extents, prots)?;
    if count < extents.len() {
        log::debug!(
            "Short map on channel {}: {} of {} extents",
            endpoint.token,
            count,
            extents.len()
        );
    }
    Ok(count)
}
