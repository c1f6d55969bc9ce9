//! # Ember HLE Kernel
//!
//! High-level-emulated kernel objects of the guest operating system:
//! - Process descriptors and the process registry
//! - Shared memory objects (creation, mapping, unmapping, destruction)
//! - The kernel system tying processes to the memory subsystem
//!
//! ## Serialization contract
//!
//! The emulated kernel serializes guest kernel calls behind a single coarse
//! lock. Nothing in this crate provides operation-level atomicity on its own;
//! the interior locks only make the reference-counted object graph
//! expressible in safe Rust. Callers must not run two kernel operations
//! against the same process or region concurrently.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod process;
pub mod shared_memory;
pub mod system;

pub use process::{Process, ProcessId, ProcessRegistry};
pub use shared_memory::{BackingSource, SharedMemory};
pub use system::KernelSystem;

use bitflags::bitflags;
use ember_memory::MemError;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Guest-visible kernel errors.
///
/// These surface to emulated software as kernel error codes. Emulator-internal
/// invariant violations (allocation exhaustion at creation, binding failures
/// after a containment check) are panics and must never be folded into this
/// enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Requested permissions or addressing mode violate the creation-mode
    /// contract
    InvalidCombination,
    /// Caller-declared permissions conflict with what the object requires
    WrongPermission,
    /// Address outside the legal range
    InvalidAddress,
    /// Target region is not free or cannot hold the request
    InvalidAddressState,
    /// Not enough memory to satisfy a guest request
    OutOfMemory,
}

impl From<MemError> for KernelError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory => KernelError::OutOfMemory,
            MemError::InvalidAddress => KernelError::InvalidAddress,
            MemError::InvalidAddressState => KernelError::InvalidAddressState,
        }
    }
}

bitflags! {
    /// Kernel-level memory permission mask used by shared memory objects.
    ///
    /// `DONT_CARE` is a sentinel, not a right: it means "no cross-process
    /// permission requirement; the mapping request is authoritative".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryPermission: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
        /// No permission requirement (see type docs)
        const DONT_CARE = 1 << 28;
    }
}

impl MemoryPermission {
    /// Read + Write
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Read + Write + Execute
    pub const READ_WRITE_EXECUTE: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}
