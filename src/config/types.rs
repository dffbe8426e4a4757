/// Core types shared by every hostpal subsystem
use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Error taxonomy exposed above the host seam.
///
/// Host-specific error codes are translated into this enumeration at the
/// boundary (see [`crate::kernel::host::check`]); nothing above the host seam
/// inspects raw errno values.
#[derive(Error, Debug)]
pub enum PalError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Interrupted with {remaining:?} remaining")]
    Interrupted { remaining: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No resource: {0}")]
    NoResource(String),

    #[error("Try again: {0}")]
    TryAgain(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw codes returned on the host-facing ABI.
pub mod code {
    pub const INVALID_ARGUMENT: i32 = -1;
    pub const NO_MEMORY: i32 = -2;
    pub const DENIED: i32 = -3;
    pub const INTERRUPTED: i32 = -4;
    pub const NOT_FOUND: i32 = -5;
    pub const NO_RESOURCE: i32 = -6;
    pub const TRY_AGAIN: i32 = -7;
}

impl PalError {
    /// Negative code for the host-facing ABI
    pub fn code(&self) -> i32 {
        match self {
            PalError::InvalidArgument(_) => code::INVALID_ARGUMENT,
            PalError::NoMemory(_) => code::NO_MEMORY,
            PalError::Denied(_) => code::DENIED,
            PalError::Interrupted { .. } => code::INTERRUPTED,
            PalError::NotFound(_) => code::NOT_FOUND,
            PalError::NoResource(_) => code::NO_RESOURCE,
            PalError::TryAgain(_) => code::TRY_AGAIN,
            PalError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => code::NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => code::DENIED,
                std::io::ErrorKind::OutOfMemory => code::NO_MEMORY,
                std::io::ErrorKind::Interrupted => code::INTERRUPTED,
                _ => code::INVALID_ARGUMENT,
            },
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, PalError::InvalidArgument(_))
    }
}

impl From<nix::errno::Errno> for PalError {
    fn from(err: nix::errno::Errno) -> Self {
        crate::kernel::host::translate_errno(err, "host call")
    }
}

pub type Result<T> = std::result::Result<T, PalError>;

/// Memory protection bits. Values match the POSIX `PROT_*` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protection(u32);

impl Protection {
    pub const NONE: Protection = Protection(0);
    pub const READ: Protection = Protection(1 << 0);
    pub const WRITE: Protection = Protection(1 << 1);
    pub const EXEC: Protection = Protection(1 << 2);
    pub const READ_WRITE: Protection = Protection(0b011);

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !0b111 == 0 {
            Some(Protection(bits))
        } else {
            None
        }
    }

    pub fn contains(&self, other: Protection) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Convert to the host `PROT_*` value
    pub fn to_host(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Protection(self.0 | rhs.0)
    }
}

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Host page size, queried once
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => 4096,
        }
    })
}

pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round up to `align`, or `None` on overflow
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_and_negative() {
        let errors = [
            PalError::InvalidArgument(String::new()),
            PalError::NoMemory(String::new()),
            PalError::Denied(String::new()),
            PalError::Interrupted { remaining: Duration::ZERO },
            PalError::NotFound(String::new()),
            PalError::NoResource(String::new()),
            PalError::TryAgain(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_protection_bits() {
        let rw = Protection::READ | Protection::WRITE;
        assert_eq!(rw, Protection::READ_WRITE);
        assert!(rw.contains(Protection::READ));
        assert!(!rw.contains(Protection::EXEC));
        assert_eq!(rw.to_host(), libc::PROT_READ | libc::PROT_WRITE);
        assert!(Protection::from_bits(8).is_none());
    }

    #[test]
    fn test_alignment_helpers() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(align_up(1, page), Some(page));
        assert_eq!(align_up(page, page), Some(page));
        assert_eq!(align_down(page + 1, page), page);
        assert_eq!(align_up(usize::MAX, page), None);
        assert!(is_page_aligned(page * 3));
        assert!(!is_page_aligned(page + 8));
    }
}
