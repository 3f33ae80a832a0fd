//! Block I/O device facade. The disk itself is an external collaborator
//! exposed only through `read_block`/`write_block`; this module is that
//! boundary plus one concrete implementation so the crate is
//! self-contained and testable without real hardware underneath it.

use crate::param::BSIZE;
use std::sync::Mutex;

/// A block-addressable storage device.
///
/// `device` in `read_block`/`write_block` lets one `BlockDevice` back
/// several logical devices (as xv6's `dev` field allows); `MemDevice` below
/// keeps a separate backing store per `device` id.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, device: u32, block_no: u32, page: &mut [u8; BSIZE]);
    fn write_block(&self, device: u32, block_no: u32, page: &[u8; BSIZE]);
}

/// An in-memory stand-in for a disk, used by tests and by any caller that
/// does not have real block storage underneath it. Blocks read before ever
/// being written come back zeroed, matching a freshly formatted disk.
#[derive(Default)]
pub struct MemDevice {
    devices: Mutex<std::collections::HashMap<u32, std::collections::HashMap<u32, [u8; BSIZE]>>>,
}

impl MemDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, device: u32, block_no: u32, page: &mut [u8; BSIZE]) {
        let devices = self.devices.lock().unwrap();
        if let Some(block) = devices.get(&device).and_then(|blocks| blocks.get(&block_no)) {
            page.copy_from_slice(block);
        } else {
            page.fill(0);
        }
    }

    fn write_block(&self, device: u32, block_no: u32, page: &[u8; BSIZE]) {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(device)
            .or_default()
            .insert(block_no, *page);
    }
}
