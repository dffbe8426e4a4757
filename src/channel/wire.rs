/// Kernel wire format for the channel device
use std::mem::size_of;

/// Commit request: parallel address and length arrays
#[repr(C)]
#[derive(Debug)]
pub struct RawCommit {
    pub entry_count: u64,
    pub addrs: *const u64,
    pub lens: *const u64,
}

/// Map request: addresses and lengths are written back by the kernel
#[repr(C)]
#[derive(Debug)]
pub struct RawMap {
    pub entry_count: u64,
    pub addrs: *mut u64,
    pub lens: *mut u64,
    pub prots: *const u64,
}

pub const CHANNEL_MAGIC: u8 = b'k';

pub const SEND: u64 = nix::request_code_write!(CHANNEL_MAGIC, 0, size_of::<RawCommit>()) as u64;
pub const RECV: u64 = nix::request_code_readwrite!(CHANNEL_MAGIC, 1, size_of::<RawMap>()) as u64;
pub const CREATE: u64 = nix::request_code_read!(CHANNEL_MAGIC, 2, size_of::<u64>()) as u64;
pub const JOIN: u64 = nix::request_code_write!(CHANNEL_MAGIC, 3, size_of::<u64>()) as u64;

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;

    #[test]
    fn test_request_codes_match_kernel_header() {
        assert_eq!(SEND, 0x4018_6b00);
        assert_eq!(RECV, 0xc020_6b01);
        assert_eq!(CREATE, 0x8008_6b02);
        assert_eq!(JOIN, 0x4008_6b03);
    }
}
