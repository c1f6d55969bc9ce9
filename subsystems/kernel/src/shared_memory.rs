//! # Shared Memory Objects
//!
//! A shared memory object is a named block of physical memory a process (or
//! the system) carves out and exposes into one or more process address
//! spaces under negotiated permissions.
//!
//! Storage comes from one of two places: freshly allocated out of a physical
//! region (the object then owns the storage and frees it on destruction), or
//! borrowed from memory already mapped in the creating process (the object
//! locks the range for its lifetime and restores it on destruction).

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use ember_hal::layout::{
    HEAP_VADDR, LINEAR_HEAP_VADDR, SHARED_MEMORY_VADDR_END,
};
use ember_hal::{PhysAddr, VirtAddr};
use ember_memory::{
    Interval, MemoryImage, MemoryRegion, MemoryRegionName, MemoryState, VmaPermission,
};
use spin::Mutex;

use crate::process::Process;
use crate::system::KernelSystem;
use crate::{KernelError, KernelResult, MemoryPermission};

/// Where a shared memory object's backing storage comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingSource {
    /// Allocate fresh storage from the named physical region
    Allocate(MemoryRegionName),
    /// Borrow the owner's existing mapping at this address
    Borrow(VirtAddr),
}

/// A shared memory kernel object.
///
/// Reference counted via `Arc`; the object may outlive its owner process, so
/// the owner is held weakly and resolved before every use.
pub struct SharedMemory {
    /// Creating process; `None` for system-owned (applet) objects
    owner: Option<Weak<Process>>,
    /// Diagnostic label, no uniqueness constraint
    name: String,
    /// Total byte length; always the sum of backing block lengths
    size: u32,
    /// Rights the owner grants itself when mapping
    permissions: MemoryPermission,
    /// Rights the owner grants any other process when mapping
    other_permissions: MemoryPermission,
    /// Zero for freshly allocated storage; the owner's original virtual
    /// address for borrowed storage
    base_address: VirtAddr,
    /// Physical extents backing the object, immutable after creation
    backing_blocks: Vec<(PhysAddr, u32)>,
    /// Intervals this object must free on destruction; empty for borrowed
    /// storage
    holding_memory: Vec<Interval>,
    /// Physical offset used to synthesize the legacy linear heap address
    linear_heap_phys_offset: u32,
    /// The emulated physical memory image
    memory: Arc<MemoryImage>,
    /// Region the held intervals are returned to on destruction
    home_region: Arc<Mutex<MemoryRegion>>,
}

impl KernelSystem {
    /// Create a shared memory object.
    ///
    /// With [`BackingSource::Allocate`], fresh storage is linearly allocated
    /// from the given region and zero-filled; exhaustion of the region is a
    /// kernel invariant violation and panics. With [`BackingSource::Borrow`],
    /// the owner (required) must already have the range mapped as private
    /// read/write memory; the range is locked for the object's lifetime and
    /// state-change failures propagate to the guest.
    pub fn create_shared_memory(
        &self,
        owner: Option<&Arc<Process>>,
        size: u32,
        permissions: MemoryPermission,
        other_permissions: MemoryPermission,
        source: BackingSource,
        name: &str,
    ) -> KernelResult<Arc<SharedMemory>> {
        // A zero-sized object has no backing extent to bind.
        if size == 0 {
            return Err(KernelError::InvalidAddress);
        }

        let mut shared = SharedMemory {
            owner: owner.map(Arc::downgrade),
            name: String::from(name),
            size,
            permissions,
            other_permissions,
            base_address: VirtAddr::ZERO,
            backing_blocks: Vec::new(),
            holding_memory: Vec::new(),
            linear_heap_phys_offset: 0,
            memory: Arc::clone(self.memory()),
            home_region: Arc::clone(self.region(MemoryRegionName::System)),
        };

        match source {
            BackingSource::Allocate(region_name) => {
                let paddr = self
                    .region(region_name)
                    .lock()
                    .linear_allocate(size)
                    .expect("not enough space in region to allocate shared memory");
                self.memory().zero(paddr, size);

                shared.backing_blocks.push((paddr, size));
                shared
                    .holding_memory
                    .push(Interval::new(paddr.as_u32(), paddr.as_u32() + size));
                shared.linear_heap_phys_offset = paddr.as_u32();
                shared.home_region = Arc::clone(self.region(region_name));

                if let Some(owner) = owner {
                    owner.add_memory_used(size as u64);
                }
            }
            BackingSource::Borrow(address) => {
                let owner = owner.expect("borrowed shared memory requires an owner process");
                // The memory is already available and mapped in the owner.
                owner.vm().write().change_memory_state(
                    address,
                    size,
                    MemoryState::Private,
                    VmaPermission::READ_WRITE,
                    MemoryState::Locked,
                    SharedMemory::convert_permissions(permissions),
                )?;

                shared.backing_blocks = owner
                    .vm()
                    .read()
                    .backing_blocks_for_range(address, size)
                    .expect("range was just verified by the state change");
                shared.base_address = address;
            }
        }

        log::debug!(
            "created shared memory '{}': {:#x} bytes, {} extent(s)",
            shared.name,
            shared.size,
            shared.backing_blocks.len()
        );
        Ok(Arc::new(shared))
    }

    /// Create a system-owned shared memory object for an applet.
    ///
    /// Storage is heap-allocated from the system region and may be split
    /// into several disjoint extents; exhaustion panics. The object has no
    /// owner process and reports `HEAP_VADDR + offset` as its base address.
    pub fn create_shared_memory_for_applet(
        &self,
        offset: u32,
        size: u32,
        permissions: MemoryPermission,
        other_permissions: MemoryPermission,
        name: &str,
    ) -> Arc<SharedMemory> {
        assert!(size != 0, "applet shared memory must not be empty");
        let blocks = self
            .region(MemoryRegionName::System)
            .lock()
            .heap_allocate(size);
        assert!(
            !blocks.is_empty(),
            "not enough space in region to allocate shared memory"
        );

        let mut backing_blocks = Vec::with_capacity(blocks.len());
        for interval in &blocks {
            self.memory().zero(interval.base(), interval.len());
            backing_blocks.push((interval.base(), interval.len()));
        }

        log::debug!(
            "created applet shared memory '{}': {:#x} bytes, {} extent(s)",
            name,
            size,
            backing_blocks.len()
        );
        Arc::new(SharedMemory {
            owner: None,
            name: String::from(name),
            size,
            permissions,
            other_permissions,
            base_address: VirtAddr::new(HEAP_VADDR + offset),
            backing_blocks,
            holding_memory: blocks,
            linear_heap_phys_offset: 0,
            memory: Arc::clone(self.memory()),
            home_region: Arc::clone(self.region(MemoryRegionName::System)),
        })
    }
}

impl SharedMemory {
    /// Map this object into `target`'s address space.
    ///
    /// Validates the permission negotiation and the destination, then binds
    /// every backing extent at consecutive addresses. A binding failure after
    /// the destination check has passed is a collaborator contract violation
    /// and panics.
    pub fn map(
        &self,
        target: &Arc<Process>,
        address: VirtAddr,
        permissions: MemoryPermission,
        other_permissions: MemoryPermission,
    ) -> KernelResult<()> {
        let is_owner = self
            .owner
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|owner| Arc::ptr_eq(&owner, target));
        let own_other_permissions = if is_owner {
            self.permissions
        } else {
            self.other_permissions
        };

        // Freshly allocated blocks can only be mapped with other_permissions
        // = DONT_CARE.
        if self.base_address == VirtAddr::ZERO
            && other_permissions != MemoryPermission::DONT_CARE
        {
            return Err(KernelError::InvalidCombination);
        }

        // The request must stay within what the creating process granted.
        // A DONT_CARE grant carries no default: the request is authoritative.
        if own_other_permissions != MemoryPermission::DONT_CARE
            && !own_other_permissions.contains(permissions)
        {
            log::error!(
                "cannot map '{}' at {}: requested {:?} exceeds granted {:?}",
                self.name,
                address,
                permissions,
                own_other_permissions
            );
            return Err(KernelError::InvalidCombination);
        }

        // Borrowed blocks require explicit cross-process negotiation.
        if self.base_address != VirtAddr::ZERO
            && other_permissions == MemoryPermission::DONT_CARE
        {
            log::error!(
                "cannot map '{}' at {}: borrowed object mapped with DONT_CARE",
                self.name,
                address
            );
            return Err(KernelError::InvalidCombination);
        }

        // The declared other-process rights must cover what this object
        // requires.
        if other_permissions != MemoryPermission::DONT_CARE
            && !other_permissions.contains(self.permissions)
        {
            log::error!(
                "cannot map '{}' at {}: object requires {:?}, caller declared {:?}",
                self.name,
                address,
                self.permissions,
                other_permissions
            );
            return Err(KernelError::WrongPermission);
        }

        if address != VirtAddr::ZERO
            && (address.as_u32() < HEAP_VADDR
                || address.end_wide(self.size) >= SHARED_MEMORY_VADDR_END as u64)
        {
            log::error!("cannot map '{}' at {}: invalid address", self.name, address);
            return Err(KernelError::InvalidAddress);
        }

        let mut target_address = address;
        if self.base_address == VirtAddr::ZERO && target_address == VirtAddr::ZERO {
            // Even on newer firmware the placement stays in the legacy linear
            // heap window; system objects (e.g. the shared font) rely on it.
            target_address = VirtAddr::new(LINEAR_HEAP_VADDR + self.linear_heap_phys_offset);
        }

        {
            let vm = target.vm().read();
            let destination_free = vm.find_vma(target_address).is_some_and(|vma| {
                vma.state == MemoryState::Free
                    && vma.end() as u64 >= target_address.end_wide(self.size)
            });
            if !destination_free {
                log::error!(
                    "cannot map '{}' at {}: destination not free",
                    self.name,
                    target_address
                );
                return Err(KernelError::InvalidAddressState);
            }
        }

        let mut vm = target.vm().write();
        let mut interval_target = target_address;
        for &(paddr, length) in &self.backing_blocks {
            let handle = vm
                .map_backing_memory(interval_target, paddr, length, MemoryState::Shared)
                .expect("backing bind cannot fail after the destination check");
            vm.reprotect(handle, Self::convert_permissions(permissions))
                .expect("reprotect of a freshly mapped area cannot fail");
            interval_target = interval_target.add(length);
        }
        Ok(())
    }

    /// Unmap this object's size worth of address space at `address`.
    ///
    /// Forwarded to the target's range unmap; the hardware behavior for an
    /// address this object was never mapped at is undocumented, so whatever
    /// the range unmap does there is what the guest sees.
    pub fn unmap(&self, target: &Process, address: VirtAddr) -> KernelResult<()> {
        target
            .vm()
            .write()
            .unmap_range(address, self.size)
            .map_err(KernelError::from)
    }

    /// Convert kernel permissions to the address-space protection mask.
    ///
    /// Pure and total: everything outside the R/W/X bit range (including the
    /// DONT_CARE sentinel) is masked off.
    pub fn convert_permissions(permission: MemoryPermission) -> VmaPermission {
        VmaPermission::from_bits_truncate(
            permission.bits() & MemoryPermission::READ_WRITE_EXECUTE.bits(),
        )
    }

    /// Copy bytes out of the object's backing storage.
    ///
    /// Bounded: fails with `InvalidAddress` if `[offset, offset + buf.len())`
    /// exceeds the object, and walks extents, so discontiguous objects are
    /// safe to read.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> KernelResult<()> {
        let mut position = 0usize;
        for (paddr, length) in self.span(offset, buf.len() as u32)? {
            self.memory
                .read(paddr, &mut buf[position..position + length as usize]);
            position += length as usize;
        }
        Ok(())
    }

    /// Copy bytes into the object's backing storage; bounded like
    /// [`SharedMemory::read`].
    pub fn write(&self, offset: u32, bytes: &[u8]) -> KernelResult<()> {
        let mut position = 0usize;
        for (paddr, length) in self.span(offset, bytes.len() as u32)? {
            self.memory
                .write(paddr, &bytes[position..position + length as usize]);
            position += length as usize;
        }
        Ok(())
    }

    /// Total byte length
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Diagnostic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rights the owner granted itself
    pub fn permissions(&self) -> MemoryPermission {
        self.permissions
    }

    /// Rights the owner granted other processes
    pub fn other_permissions(&self) -> MemoryPermission {
        self.other_permissions
    }

    /// Zero for freshly allocated storage, the owner's original address
    /// otherwise
    pub fn base_address(&self) -> VirtAddr {
        self.base_address
    }

    /// Physical extents backing this object
    pub fn backing_blocks(&self) -> &[(PhysAddr, u32)] {
        &self.backing_blocks
    }

    /// Whether the backing storage is one contiguous extent
    pub fn is_contiguous(&self) -> bool {
        self.backing_blocks.len() == 1
    }

    /// Resolve `[offset, offset + len)` to physical chunks across extents
    fn span(&self, offset: u32, len: u32) -> KernelResult<Vec<(PhysAddr, u32)>> {
        if offset as u64 + len as u64 > self.size as u64 {
            return Err(KernelError::InvalidAddress);
        }

        let mut chunks = Vec::new();
        let end = offset + len;
        let mut cursor = offset;
        let mut block_start = 0u32;
        for &(paddr, length) in &self.backing_blocks {
            let block_end = block_start + length;
            if cursor >= end {
                break;
            }
            if cursor < block_end {
                let take = (block_end - cursor).min(end - cursor);
                chunks.push((paddr.add(cursor - block_start), take));
                cursor += take;
            }
            block_start = block_end;
        }
        Ok(chunks)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // Freshly allocated objects own their storage; each held interval is
        // returned exactly once.
        {
            let mut region = self.home_region.lock();
            for &interval in &self.holding_memory {
                region.free(interval);
            }
        }

        // Borrowed objects give the owner its private mapping back, unless
        // the owner is already gone (its own teardown reclaimed the memory).
        if self.base_address != VirtAddr::ZERO {
            if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
                let restored = owner.vm().write().change_memory_state(
                    self.base_address,
                    self.size,
                    MemoryState::Locked,
                    Self::convert_permissions(self.permissions),
                    MemoryState::Private,
                    VmaPermission::READ_WRITE,
                );
                if let Err(err) = restored {
                    log::error!(
                        "failed to restore owner mapping of '{}': {:?}",
                        self.name,
                        err
                    );
                }
            }
        }
    }
}
