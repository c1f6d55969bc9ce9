//! # Emulated Physical Memory Image
//!
//! A single byte array standing in for the console's FCRAM. All physical
//! addresses in the emulator are offsets into this image.

use alloc::vec;
use alloc::vec::Vec;
use ember_hal::PhysAddr;
use spin::RwLock;

/// The emulated physical memory image.
///
/// Bounds are an emulator invariant: callers hand out physical addresses only
/// through the region allocators, so an out-of-range access here is a bug in
/// the kernel core, not a guest-visible error. Accesses panic accordingly.
pub struct MemoryImage {
    /// Raw backing bytes
    data: RwLock<Vec<u8>>,
}

impl MemoryImage {
    /// Create a zero-filled image of `size` bytes
    pub fn new(size: u32) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
        }
    }

    /// Total image size in bytes
    pub fn size(&self) -> u32 {
        self.data.read().len() as u32
    }

    /// Copy bytes out of the image starting at `addr`
    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let start = addr.as_u32() as usize;
        buf.copy_from_slice(&self.data.read()[start..start + buf.len()]);
    }

    /// Copy bytes into the image starting at `addr`
    pub fn write(&self, addr: PhysAddr, bytes: &[u8]) {
        let start = addr.as_u32() as usize;
        self.data.write()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Zero-fill `len` bytes starting at `addr`
    pub fn zero(&self, addr: PhysAddr, len: u32) {
        let start = addr.as_u32() as usize;
        self.data.write()[start..start + len as usize].fill(0);
    }
}
