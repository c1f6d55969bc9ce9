//! # Ember Memory Subsystem
//!
//! The memory subsystem provides:
//! - The emulated physical memory image (FCRAM)
//! - Named physical region allocators (application, system, base)
//! - Per-process virtual address space management
//!
//! Kernel objects (shared memory, processes) live in `ember-kernel` and
//! consume these collaborators; nothing in this crate knows about kernel
//! object lifecycles.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address_space;
pub mod image;
pub mod region;

pub use address_space::{AddressSpace, MemoryState, Vma, VmaPermission};
pub use image::MemoryImage;
pub use region::{Interval, MemoryRegion, MemoryRegionName};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
///
/// These are the guest-visible outcomes of address-space and region
/// operations. Emulator-internal invariant violations (out-of-range image
/// accesses, double frees) are panics, never `MemError` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Not enough free space in the physical region
    OutOfMemory,
    /// Address outside the managed range
    InvalidAddress,
    /// Target range is not in the expected state
    InvalidAddressState,
}
