//! Integration tests for the physical memory channel
//!
//! Two endpoints on the loopback driver stand in for two cooperating
//! processes.

use hostpal::channel::{commit, create_channel, join_channel, map, CommitFlags, Extent, LoopbackDriver};
use hostpal::config::types::{align_up, page_size, Protection};
use hostpal::kernel::{check, HostCalls, LinuxHost};
use hostpal::PalError;
use std::sync::Arc;

fn alloc(host: &LinuxHost, len: usize) -> usize {
    let len = align_up(len, page_size()).unwrap();
    check(host.map_anonymous(0, len, Protection::READ_WRITE), "alloc").unwrap()
}

fn fill(addr: usize, len: usize, seed: u8) {
    // SAFETY: `addr..addr+len` is a private read-write mapping owned by the test.
    let bytes = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) };
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = seed.wrapping_add((i % 251) as u8);
    }
}

fn contents(addr: usize, len: usize) -> Vec<u8> {
    // SAFETY: the range is mapped readable for the duration of the test.
    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

#[test]
fn test_committed_pages_arrive_intact_with_short_count() {
    let host = LinuxHost::new();
    let driver = Arc::new(LoopbackDriver::new(Arc::new(host)));
    let (sender, token) = create_channel(driver.clone()).unwrap();
    let receiver = join_channel(driver.clone(), token).unwrap();

    let a = alloc(&host, 4096);
    let b = alloc(&host, 8192);
    fill(a, 4096, 0x11);
    fill(b, 8192, 0x77);
    let expected_a = contents(a, 4096);
    let expected_b = contents(b, 8192);

    let committed = unsafe {
        commit(
            &sender,
            &[Extent::new(a, 4096), Extent::new(b, 8192)],
            CommitFlags::NONE,
        )
    }
    .unwrap();
    assert_eq!(committed, 2);
    assert_eq!(driver.pending(token), 2);

    // The sender's pages may change after commit without affecting delivery.
    fill(a, 4096, 0xee);

    let mut out = [Extent::default(); 3];
    let prots = [Protection::READ; 3];
    let mapped = unsafe { map(&receiver, &mut out, &prots) }.unwrap();
    assert_eq!(mapped, 2, "short count when fewer extents were queued");
    assert_eq!(contents(out[0].addr, 4096), expected_a);
    assert_eq!(contents(out[1].addr, 8192), expected_b);
    assert_eq!(out[2], Extent::default());

    let mut more = [Extent::default()];
    assert_eq!(unsafe { map(&receiver, &mut more, &[Protection::READ]) }.unwrap(), 0);

    for extent in &out[..2] {
        host.unmap(extent.addr, extent.len);
    }
    host.unmap(a, align_up(4096, page_size()).unwrap());
    host.unmap(b, align_up(8192, page_size()).unwrap());
}

#[test]
fn test_extents_are_delivered_in_commit_order() {
    let host = LinuxHost::new();
    let driver = Arc::new(LoopbackDriver::new(Arc::new(host)));
    let (sender, token) = create_channel(driver.clone()).unwrap();
    let receiver = join_channel(driver, token).unwrap();
    let page = page_size();

    let sources: Vec<usize> = (0..4u8)
        .map(|i| {
            let addr = alloc(&host, page);
            fill(addr, page, i + 1);
            addr
        })
        .collect();
    for addr in &sources {
        unsafe { commit(&sender, &[Extent::new(*addr, page)], CommitFlags::NONE) }.unwrap();
    }

    for (i, src) in sources.iter().enumerate() {
        let mut out = [Extent::default()];
        assert_eq!(unsafe { map(&receiver, &mut out, &[Protection::READ]) }.unwrap(), 1);
        assert_eq!(contents(out[0].addr, page), contents(*src, page), "extent {}", i);
        host.unmap(out[0].addr, out[0].len);
        host.unmap(*src, page);
    }
}

#[test]
fn test_unaligned_commit_is_rejected() {
    let host = LinuxHost::new();
    let driver = Arc::new(LoopbackDriver::new(Arc::new(host)));
    let (sender, token) = create_channel(driver.clone()).unwrap();
    let a = alloc(&host, page_size());

    let err = unsafe { commit(&sender, &[Extent::new(a + 1, 64)], CommitFlags::NONE) }.unwrap_err();
    assert!(matches!(err, PalError::InvalidArgument(_)));
    assert_eq!(driver.pending(token), 0);
    host.unmap(a, page_size());
}
