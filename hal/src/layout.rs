//! # Guest Memory Layout
//!
//! Fixed physical and virtual memory map of the emulated console. The
//! physical FCRAM is partitioned into three named regions; the virtual map
//! reserves dedicated bands for the process heap, shared memory and the
//! legacy identity-mapped linear heap.

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Guest page size in bytes
pub const PAGE_SIZE: u32 = 0x1000;

/// Total size of the emulated physical memory (FCRAM)
pub const FCRAM_SIZE: u32 = 0x0800_0000;

/// Size of the application physical region
pub const APPLICATION_REGION_SIZE: u32 = 0x0400_0000;

/// Size of the system physical region
pub const SYSTEM_REGION_SIZE: u32 = 0x0280_0000;

/// Size of the base physical region
pub const BASE_REGION_SIZE: u32 = 0x0180_0000;

/// Virtual base of the process heap band
pub const HEAP_VADDR: u32 = 0x0800_0000;

/// Virtual base of the shared memory band
pub const SHARED_MEMORY_VADDR: u32 = 0x1000_0000;

/// Exclusive virtual end of the shared memory band
pub const SHARED_MEMORY_VADDR_END: u32 = 0x1400_0000;

/// Virtual base of the legacy linear heap.
///
/// The linear heap identity-maps FCRAM: virtual `LINEAR_HEAP_VADDR + offset`
/// corresponds to physical offset `offset`. Legacy system objects are still
/// placed here for compatibility with older firmware expectations.
pub const LINEAR_HEAP_VADDR: u32 = 0x1400_0000;

/// Exclusive virtual end of the linear heap
pub const LINEAR_HEAP_VADDR_END: u32 = 0x1C00_0000;

/// Exclusive end of an emulated process address space
pub const ADDRESS_SPACE_END: u32 = 0x4000_0000;

// The three regions must exactly partition FCRAM.
const_assert_eq!(
    APPLICATION_REGION_SIZE + SYSTEM_REGION_SIZE + BASE_REGION_SIZE,
    FCRAM_SIZE
);

// Virtual bands must be ordered and page aligned.
const_assert!(HEAP_VADDR < SHARED_MEMORY_VADDR);
const_assert!(SHARED_MEMORY_VADDR < SHARED_MEMORY_VADDR_END);
const_assert!(SHARED_MEMORY_VADDR_END <= LINEAR_HEAP_VADDR);
const_assert!(LINEAR_HEAP_VADDR < LINEAR_HEAP_VADDR_END);
const_assert!(LINEAR_HEAP_VADDR_END <= ADDRESS_SPACE_END);
const_assert!(HEAP_VADDR % PAGE_SIZE == 0);
const_assert!(SHARED_MEMORY_VADDR % PAGE_SIZE == 0);
const_assert!(LINEAR_HEAP_VADDR % PAGE_SIZE == 0);

// The linear heap window must be able to cover all of FCRAM.
const_assert!(LINEAR_HEAP_VADDR_END - LINEAR_HEAP_VADDR >= FCRAM_SIZE);
