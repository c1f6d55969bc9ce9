//! # Physical Region Allocation
//!
//! Named pools of physical backing storage. Each region tracks its free space
//! as a sorted list of half-open intervals and offers two allocation styles:
//! linear allocation (one contiguous block) and heap allocation (possibly
//! several disjoint intervals). Frees are exact-interval.

use alloc::vec::Vec;
use ember_hal::PhysAddr;

/// Half-open physical interval `[start, end)` in image offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Inclusive lower bound
    pub start: u32,
    /// Exclusive upper bound
    pub end: u32,
}

impl Interval {
    /// Create an interval; `start` must not exceed `end`
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Length of the interval in bytes
    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Whether the interval is empty
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Physical address of the lower bound
    pub const fn base(&self) -> PhysAddr {
        PhysAddr::new(self.start)
    }
}

/// Named physical regions the image is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionName {
    /// Memory reserved for the running application
    Application,
    /// Memory reserved for system services
    System,
    /// Memory reserved for the base firmware
    Base,
}

/// A physical memory region.
///
/// The free list is kept sorted, disjoint and coalesced at all times.
pub struct MemoryRegion {
    /// Region name (diagnostics)
    name: MemoryRegionName,
    /// First image offset belonging to this region
    base: u32,
    /// Region size in bytes
    size: u32,
    /// Bytes currently allocated
    used: u32,
    /// Sorted list of free intervals
    free_list: Vec<Interval>,
}

impl MemoryRegion {
    /// Create a region spanning `[base, base + size)`, fully free
    pub fn new(name: MemoryRegionName, base: u32, size: u32) -> Self {
        let mut free_list = Vec::new();
        free_list.push(Interval::new(base, base + size));
        Self {
            name,
            base,
            size,
            used: 0,
            free_list,
        }
    }

    /// Region name
    pub fn name(&self) -> MemoryRegionName {
        self.name
    }

    /// First image offset of the region
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Region size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes currently allocated
    pub fn used_bytes(&self) -> u32 {
        self.used
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> u32 {
        self.size - self.used
    }

    /// Allocate one contiguous block of `size` bytes.
    ///
    /// Takes the low end of the first free interval that fits. Returns `None`
    /// if no single interval is large enough.
    pub fn linear_allocate(&mut self, size: u32) -> Option<PhysAddr> {
        let slot = self.free_list.iter().position(|iv| iv.len() >= size)?;
        let iv = self.free_list[slot];
        let addr = iv.start;
        if iv.len() == size {
            self.free_list.remove(slot);
        } else {
            self.free_list[slot] = Interval::new(iv.start + size, iv.end);
        }
        self.used += size;
        log::trace!(
            "{:?} region: linear allocated {:#x} bytes at {:#010x}",
            self.name,
            size,
            addr
        );
        Some(PhysAddr::new(addr))
    }

    /// Allocate `size` bytes, possibly as several disjoint intervals.
    ///
    /// Free intervals are consumed in address order. Returns an empty vector
    /// if the region does not have `size` free bytes in total; in that case
    /// nothing is allocated.
    pub fn heap_allocate(&mut self, size: u32) -> Vec<Interval> {
        if size > self.free_bytes() {
            return Vec::new();
        }

        let mut allocated = Vec::new();
        let mut remaining = size;
        while remaining > 0 {
            // The free-bytes check above guarantees the list is not exhausted.
            let iv = self.free_list[0];
            if iv.len() <= remaining {
                self.free_list.remove(0);
                remaining -= iv.len();
                allocated.push(iv);
            } else {
                self.free_list[0] = Interval::new(iv.start + remaining, iv.end);
                allocated.push(Interval::new(iv.start, iv.start + remaining));
                remaining = 0;
            }
        }
        self.used += size;
        log::trace!(
            "{:?} region: heap allocated {:#x} bytes in {} interval(s)",
            self.name,
            size,
            allocated.len()
        );
        allocated
    }

    /// Return an interval to the free list.
    ///
    /// The interval must lie within the region and must currently be
    /// allocated; freeing bytes that are already free is a kernel bug and
    /// panics.
    pub fn free(&mut self, interval: Interval) {
        assert!(
            interval.start >= self.base && interval.end <= self.base + self.size,
            "freed interval [{:#x}, {:#x}) outside {:?} region",
            interval.start,
            interval.end,
            self.name
        );
        if interval.is_empty() {
            return;
        }

        let pos = self
            .free_list
            .iter()
            .position(|iv| iv.start >= interval.end)
            .unwrap_or(self.free_list.len());
        if pos > 0 {
            assert!(
                self.free_list[pos - 1].end <= interval.start,
                "double free of [{:#x}, {:#x}) in {:?} region",
                interval.start,
                interval.end,
                self.name
            );
        }

        self.free_list.insert(pos, interval);
        self.used -= interval.len();
        self.coalesce_around(pos);
    }

    /// Merge the interval at `pos` with adjacent neighbours
    fn coalesce_around(&mut self, pos: usize) {
        if pos + 1 < self.free_list.len() && self.free_list[pos].end == self.free_list[pos + 1].start
        {
            self.free_list[pos].end = self.free_list[pos + 1].end;
            self.free_list.remove(pos + 1);
        }
        if pos > 0 && self.free_list[pos - 1].end == self.free_list[pos].start {
            self.free_list[pos - 1].end = self.free_list[pos].end;
            self.free_list.remove(pos);
        }
    }
}
