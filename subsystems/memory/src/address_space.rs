//! # Address Space Management
//!
//! Per-process virtual memory bookkeeping. The whole address space is covered
//! by a sorted map of virtual memory areas (VMAs); unoccupied space is
//! explicit `Free` VMAs rather than gaps, so a lookup always resolves to a
//! region descriptor. Operations split VMAs at range boundaries ("carving")
//! and re-merge compatible neighbours afterwards.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::Bound;
use ember_hal::{PhysAddr, VirtAddr};

use crate::{MemError, MemResult};

bitflags! {
    /// Native protection mask of a virtual memory area
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaPermission: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXECUTE = 1 << 2;
    }
}

impl VmaPermission {
    /// Read + Write
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Read + Write + Execute
    pub const READ_WRITE_EXECUTE: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// Ownership/protection state of a virtual memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Unallocated space
    Free,
    /// Plain private memory owned by the process
    Private,
    /// Memory mapped from a shared memory object
    Shared,
    /// Private memory locked by a kernel object (not directly usable)
    Locked,
}

/// Virtual memory area descriptor
#[derive(Debug, Clone)]
pub struct Vma {
    /// First address of the area
    pub base: VirtAddr,
    /// Size in bytes
    pub size: u32,
    /// Ownership state
    pub state: MemoryState,
    /// Protection mask
    pub permissions: VmaPermission,
    /// Physical base of the backing storage; `None` while free
    pub backing: Option<PhysAddr>,
}

impl Vma {
    /// Exclusive end address of the area
    pub fn end(&self) -> u32 {
        self.base.as_u32() + self.size
    }

    /// Check if the area contains `addr`
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr.as_u32() < self.end()
    }
}

/// A process virtual address space.
///
/// Callers are expected to serialize kernel operations; the address space
/// itself performs no locking.
pub struct AddressSpace {
    /// All VMAs, keyed by base address, covering the whole space
    vmas: alloc::collections::BTreeMap<u32, Vma>,
    /// Exclusive end of the managed space
    end: u32,
}

impl AddressSpace {
    /// Create an address space covering `[0, end)` as a single free area
    pub fn new(end: u32) -> Self {
        let mut vmas = alloc::collections::BTreeMap::new();
        vmas.insert(
            0,
            Vma {
                base: VirtAddr::ZERO,
                size: end,
                state: MemoryState::Free,
                permissions: VmaPermission::empty(),
                backing: None,
            },
        );
        Self { vmas, end }
    }

    /// Find the VMA covering `addr`
    pub fn find_vma(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas
            .range((Bound::Unbounded, Bound::Included(addr.as_u32())))
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Transition `[addr, addr + size)` between memory states.
    ///
    /// Every byte of the range must currently have exactly `expected_state`
    /// and `expected_perms`; otherwise nothing is changed and
    /// `InvalidAddressState` is returned.
    pub fn change_memory_state(
        &mut self,
        addr: VirtAddr,
        size: u32,
        expected_state: MemoryState,
        expected_perms: VmaPermission,
        new_state: MemoryState,
        new_perms: VmaPermission,
    ) -> MemResult<()> {
        self.check_contained(addr, size)?;

        for vma in self.overlapping(addr, size) {
            if vma.state != expected_state || vma.permissions != expected_perms {
                return Err(MemError::InvalidAddressState);
            }
        }

        self.carve(addr, size);
        let start = addr.as_u32();
        for (_, vma) in self.vmas.range_mut(start..start + size) {
            vma.state = new_state;
            vma.permissions = new_perms;
        }
        self.merge_adjacent();
        Ok(())
    }

    /// Collect the physical extents backing `[addr, addr + size)`.
    ///
    /// Fails with `InvalidAddressState` if any part of the range is not
    /// backed by physical memory.
    pub fn backing_blocks_for_range(
        &self,
        addr: VirtAddr,
        size: u32,
    ) -> MemResult<Vec<(PhysAddr, u32)>> {
        self.check_contained(addr, size)?;

        let start = addr.as_u32();
        let range_end = start + size;
        let mut blocks = Vec::new();
        for vma in self.overlapping(addr, size) {
            let backing = vma.backing.ok_or(MemError::InvalidAddressState)?;
            let chunk_start = vma.base.as_u32().max(start);
            let chunk_end = vma.end().min(range_end);
            blocks.push((
                backing.add(chunk_start - vma.base.as_u32()),
                chunk_end - chunk_start,
            ));
        }
        Ok(blocks)
    }

    /// Map one contiguous physical block at `addr`.
    ///
    /// The whole target range must be free. The new area is installed with
    /// read/write permissions; callers adjust via [`AddressSpace::reprotect`]
    /// using the returned base address as the handle.
    pub fn map_backing_memory(
        &mut self,
        addr: VirtAddr,
        paddr: PhysAddr,
        size: u32,
        state: MemoryState,
    ) -> MemResult<VirtAddr> {
        self.check_contained(addr, size)?;

        for vma in self.overlapping(addr, size) {
            if vma.state != MemoryState::Free {
                return Err(MemError::InvalidAddressState);
            }
        }

        self.carve(addr, size);
        let start = addr.as_u32();
        let keys: Vec<u32> = self
            .vmas
            .range(start..start + size)
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            self.vmas.remove(&key);
        }
        self.vmas.insert(
            start,
            Vma {
                base: addr,
                size,
                state,
                permissions: VmaPermission::READ_WRITE,
                backing: Some(paddr),
            },
        );
        Ok(addr)
    }

    /// Change the protection of the VMA based at `vma_base`
    pub fn reprotect(&mut self, vma_base: VirtAddr, new_perms: VmaPermission) -> MemResult<()> {
        let vma = self
            .vmas
            .get_mut(&vma_base.as_u32())
            .ok_or(MemError::InvalidAddress)?;
        vma.permissions = new_perms;
        Ok(())
    }

    /// Return `[addr, addr + size)` to the free state.
    ///
    /// Whatever is currently there is dropped; unmapping already-free space
    /// is a no-op. Out-of-space ranges fail with `InvalidAddress`.
    pub fn unmap_range(&mut self, addr: VirtAddr, size: u32) -> MemResult<()> {
        self.check_contained(addr, size)?;

        self.carve(addr, size);
        let start = addr.as_u32();
        for (_, vma) in self.vmas.range_mut(start..start + size) {
            vma.state = MemoryState::Free;
            vma.permissions = VmaPermission::empty();
            vma.backing = None;
        }
        self.merge_adjacent();
        Ok(())
    }

    /// Verify `[addr, addr + size)` lies inside the managed space
    fn check_contained(&self, addr: VirtAddr, size: u32) -> MemResult<()> {
        if size == 0 || addr.end_wide(size) > self.end as u64 {
            return Err(MemError::InvalidAddress);
        }
        Ok(())
    }

    /// Iterate over the VMAs overlapping `[addr, addr + size)`
    fn overlapping(&self, addr: VirtAddr, size: u32) -> impl Iterator<Item = &Vma> {
        let start = addr.as_u32();
        let range_end = start + size;
        self.vmas
            .range((Bound::Unbounded, Bound::Excluded(range_end)))
            .map(|(_, vma)| vma)
            .filter(move |vma| vma.end() > start)
    }

    /// Split VMAs so that both `addr` and `addr + size` fall on boundaries
    fn carve(&mut self, addr: VirtAddr, size: u32) {
        self.split_at(addr.as_u32());
        self.split_at(addr.as_u32() + size);
    }

    /// Split the VMA covering `point` (if `point` is interior to it)
    fn split_at(&mut self, point: u32) {
        if point >= self.end {
            return;
        }
        let (&key, vma) = self
            .vmas
            .range((Bound::Unbounded, Bound::Included(point)))
            .next_back()
            .expect("address space must cover every address");
        if key == point || vma.end() <= point {
            return;
        }

        let left_size = point - key;
        let right = Vma {
            base: VirtAddr::new(point),
            size: vma.end() - point,
            state: vma.state,
            permissions: vma.permissions,
            backing: vma.backing.map(|b| b.add(left_size)),
        };
        let left = self.vmas.get_mut(&key).expect("vma just looked up");
        left.size = left_size;
        self.vmas.insert(point, right);
    }

    /// Merge neighbouring VMAs with identical state, permissions and
    /// contiguous backing
    fn merge_adjacent(&mut self) {
        let keys: Vec<u32> = self.vmas.keys().copied().collect();
        for key in keys {
            loop {
                let Some(vma) = self.vmas.get(&key) else {
                    break;
                };
                let next_key = vma.end();
                let Some(next) = self.vmas.get(&next_key) else {
                    break;
                };

                let backing_contiguous = match (vma.backing, next.backing) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.add(vma.size) == b,
                    _ => false,
                };
                if vma.state != next.state
                    || vma.permissions != next.permissions
                    || !backing_contiguous
                {
                    break;
                }

                let grown = next.size;
                self.vmas.remove(&next_key);
                self.vmas
                    .get_mut(&key)
                    .expect("vma just looked up")
                    .size += grown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE_END: u32 = 0x4000_0000;

    fn space() -> AddressSpace {
        AddressSpace::new(SPACE_END)
    }

    #[test]
    fn test_new_space_is_one_free_vma() {
        let space = space();
        let vma = space.find_vma(VirtAddr::new(0x1234_5678)).unwrap();
        assert_eq!(vma.base, VirtAddr::ZERO);
        assert_eq!(vma.size, SPACE_END);
        assert_eq!(vma.state, MemoryState::Free);
    }

    #[test]
    fn test_map_backing_memory_splits_free_space() {
        let mut space = space();
        let handle = space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x2000,
                MemoryState::Private,
            )
            .unwrap();
        assert_eq!(handle, VirtAddr::new(0x0800_0000));

        let vma = space.find_vma(VirtAddr::new(0x0800_1000)).unwrap();
        assert_eq!(vma.state, MemoryState::Private);
        assert_eq!(vma.permissions, VmaPermission::READ_WRITE);
        assert_eq!(vma.backing, Some(PhysAddr::new(0x1000)));

        // Space on both sides stays free.
        assert_eq!(
            space.find_vma(VirtAddr::new(0x07FF_F000)).unwrap().state,
            MemoryState::Free
        );
        assert_eq!(
            space.find_vma(VirtAddr::new(0x0800_2000)).unwrap().state,
            MemoryState::Free
        );
    }

    #[test]
    fn test_map_backing_memory_rejects_occupied_range() {
        let mut space = space();
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x2000,
                MemoryState::Private,
            )
            .unwrap();
        // Overlapping the tail page must fail.
        let result = space.map_backing_memory(
            VirtAddr::new(0x0800_1000),
            PhysAddr::new(0x8000),
            0x2000,
            MemoryState::Shared,
        );
        assert_eq!(result, Err(MemError::InvalidAddressState));
    }

    #[test]
    fn test_map_backing_memory_out_of_space() {
        let mut space = space();
        let result = space.map_backing_memory(
            VirtAddr::new(SPACE_END - 0x1000),
            PhysAddr::new(0),
            0x2000,
            MemoryState::Private,
        );
        assert_eq!(result, Err(MemError::InvalidAddress));
    }

    #[test]
    fn test_change_memory_state_verifies_old_state() {
        let mut space = space();
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x4000,
                MemoryState::Private,
            )
            .unwrap();

        // Wrong expected permissions: rejected, nothing changed.
        let result = space.change_memory_state(
            VirtAddr::new(0x0800_0000),
            0x4000,
            MemoryState::Private,
            VmaPermission::READ,
            MemoryState::Locked,
            VmaPermission::empty(),
        );
        assert_eq!(result, Err(MemError::InvalidAddressState));
        assert_eq!(
            space.find_vma(VirtAddr::new(0x0800_0000)).unwrap().state,
            MemoryState::Private
        );

        // Correct expectations succeed.
        space
            .change_memory_state(
                VirtAddr::new(0x0800_0000),
                0x4000,
                MemoryState::Private,
                VmaPermission::READ_WRITE,
                MemoryState::Locked,
                VmaPermission::READ,
            )
            .unwrap();
        let vma = space.find_vma(VirtAddr::new(0x0800_0000)).unwrap();
        assert_eq!(vma.state, MemoryState::Locked);
        assert_eq!(vma.permissions, VmaPermission::READ);
        // Backing survives the transition.
        assert_eq!(vma.backing, Some(PhysAddr::new(0x1000)));
    }

    #[test]
    fn test_change_memory_state_partial_range_splits() {
        let mut space = space();
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x4000,
                MemoryState::Private,
            )
            .unwrap();
        space
            .change_memory_state(
                VirtAddr::new(0x0800_1000),
                0x1000,
                MemoryState::Private,
                VmaPermission::READ_WRITE,
                MemoryState::Locked,
                VmaPermission::empty(),
            )
            .unwrap();

        assert_eq!(
            space.find_vma(VirtAddr::new(0x0800_0000)).unwrap().state,
            MemoryState::Private
        );
        let locked = space.find_vma(VirtAddr::new(0x0800_1000)).unwrap();
        assert_eq!(locked.state, MemoryState::Locked);
        assert_eq!(locked.size, 0x1000);
        // Split backing must stay offset-correct.
        assert_eq!(locked.backing, Some(PhysAddr::new(0x2000)));
        assert_eq!(
            space.find_vma(VirtAddr::new(0x0800_2000)).unwrap().state,
            MemoryState::Private
        );
    }

    #[test]
    fn test_backing_blocks_for_range() {
        let mut space = space();
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x2000,
                MemoryState::Private,
            )
            .unwrap();
        // Adjacent but physically discontiguous mapping.
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_2000),
                PhysAddr::new(0x9000),
                0x1000,
                MemoryState::Private,
            )
            .unwrap();

        let blocks = space
            .backing_blocks_for_range(VirtAddr::new(0x0800_1000), 0x2000)
            .unwrap();
        assert_eq!(
            blocks,
            alloc::vec![
                (PhysAddr::new(0x2000), 0x1000),
                (PhysAddr::new(0x9000), 0x1000)
            ]
        );
    }

    #[test]
    fn test_backing_blocks_rejects_unmapped_range() {
        let space = space();
        let result = space.backing_blocks_for_range(VirtAddr::new(0x0800_0000), 0x1000);
        assert_eq!(result, Err(MemError::InvalidAddressState));
    }

    #[test]
    fn test_unmap_range_restores_single_free_vma() {
        let mut space = space();
        space
            .map_backing_memory(
                VirtAddr::new(0x0800_0000),
                PhysAddr::new(0x1000),
                0x2000,
                MemoryState::Shared,
            )
            .unwrap();
        space.unmap_range(VirtAddr::new(0x0800_0000), 0x2000).unwrap();

        let vma = space.find_vma(VirtAddr::new(0x0800_0000)).unwrap();
        assert_eq!(vma.state, MemoryState::Free);
        assert_eq!(vma.base, VirtAddr::ZERO);
        assert_eq!(vma.size, SPACE_END);
        assert_eq!(vma.backing, None);
    }

    #[test]
    fn test_unmap_of_free_range_is_noop() {
        let mut space = space();
        // Delegated behavior for unmapped ranges: succeeds, changes nothing.
        space.unmap_range(VirtAddr::new(0x0900_0000), 0x1000).unwrap();
        let vma = space.find_vma(VirtAddr::ZERO).unwrap();
        assert_eq!(vma.size, SPACE_END);
    }

    #[test]
    fn test_reprotect_by_handle() {
        let mut space = space();
        let handle = space
            .map_backing_memory(
                VirtAddr::new(0x1000_0000),
                PhysAddr::new(0x1000),
                0x1000,
                MemoryState::Shared,
            )
            .unwrap();
        space.reprotect(handle, VmaPermission::READ).unwrap();
        assert_eq!(
            space.find_vma(handle).unwrap().permissions,
            VmaPermission::READ
        );

        // A non-VMA-base address is not a valid handle.
        let result = space.reprotect(VirtAddr::new(0x1000_0800), VmaPermission::READ);
        assert_eq!(result, Err(MemError::InvalidAddress));
    }
}
