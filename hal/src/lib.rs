//! # Ember HAL - Guest Hardware Abstractions
//!
//! This crate defines the address types and the physical memory layout of the
//! emulated machine. The guest is a 32-bit handheld console, so both address
//! types wrap a `u32`.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Minimal**: Only exposes what the kernel subsystems need
//! - **Typed**: Physical and virtual addresses can never be mixed up
//! - **Checked**: Layout constants are validated at compile time

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod layout;

use core::fmt;

/// Physical address into the emulated memory image (FCRAM offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 % align == 0
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u32) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u32) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add a byte offset to the address
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }

    /// Byte distance from `base` to this address
    #[inline]
    pub const fn offset_from(self, base: PhysAddr) -> u32 {
        self.0 - base.0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010x}", self.0)
    }
}

/// Virtual address in an emulated process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    /// The zero address (used as "no address" in creation/mapping requests)
    pub const ZERO: Self = Self(0);

    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is aligned to the given alignment
    #[inline]
    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 % align == 0
    }

    /// Align the address up to the given alignment
    #[inline]
    pub const fn align_up(self, align: u32) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Align the address down to the given alignment
    #[inline]
    pub const fn align_down(self, align: u32) -> Self {
        Self(self.0 & !(align - 1))
    }

    /// Add a byte offset to the address
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0 + offset)
    }

    /// End of the range `[self, self + size)`, widened to avoid u32 wraparound
    #[inline]
    pub const fn end_wide(self, size: u32) -> u64 {
        self.0 as u64 + size as u64
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        let addr = PhysAddr::new(0x1234);
        assert!(!addr.is_aligned(0x1000));
        assert_eq!(addr.align_down(0x1000), PhysAddr::new(0x1000));
        assert_eq!(addr.align_up(0x1000), PhysAddr::new(0x2000));
        assert!(PhysAddr::new(0x2000).is_aligned(0x1000));
    }

    #[test]
    fn test_offset_arithmetic() {
        let base = PhysAddr::new(0x4000);
        assert_eq!(base.add(0x800).offset_from(base), 0x800);

        let va = VirtAddr::new(0xFFFF_F000);
        // The widened end must not wrap even near the top of the space.
        assert_eq!(va.end_wide(0x2000), 0x1_0000_1000);
    }
}
