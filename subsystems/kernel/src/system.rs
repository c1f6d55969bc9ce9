//! # Kernel System
//!
//! Ties the kernel objects to the memory subsystem: owns the emulated
//! physical memory image, the three physical regions and the process
//! registry.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use ember_hal::layout::{
    APPLICATION_REGION_SIZE, BASE_REGION_SIZE, FCRAM_SIZE, SYSTEM_REGION_SIZE,
};
use ember_hal::VirtAddr;
use ember_memory::{MemoryImage, MemoryRegion, MemoryRegionName, MemoryState};
use spin::Mutex;

use crate::process::{Process, ProcessId, ProcessRegistry};
use crate::KernelResult;

/// The emulated kernel.
pub struct KernelSystem {
    /// Emulated physical memory image
    memory: Arc<MemoryImage>,
    /// Application physical region
    application_region: Arc<Mutex<MemoryRegion>>,
    /// System physical region
    system_region: Arc<Mutex<MemoryRegion>>,
    /// Base physical region
    base_region: Arc<Mutex<MemoryRegion>>,
    /// Live processes
    registry: ProcessRegistry,
    /// Next process ID
    next_pid: AtomicU32,
}

impl KernelSystem {
    /// Create a kernel with a zeroed memory image and the fixed region
    /// partition of the emulated machine
    pub fn new() -> Self {
        let application_base = 0;
        let system_base = APPLICATION_REGION_SIZE;
        let base_base = APPLICATION_REGION_SIZE + SYSTEM_REGION_SIZE;
        log::debug!(
            "kernel memory: application {:#x}, system {:#x}, base {:#x} bytes",
            APPLICATION_REGION_SIZE,
            SYSTEM_REGION_SIZE,
            BASE_REGION_SIZE
        );

        Self {
            memory: Arc::new(MemoryImage::new(FCRAM_SIZE)),
            application_region: Arc::new(Mutex::new(MemoryRegion::new(
                MemoryRegionName::Application,
                application_base,
                APPLICATION_REGION_SIZE,
            ))),
            system_region: Arc::new(Mutex::new(MemoryRegion::new(
                MemoryRegionName::System,
                system_base,
                SYSTEM_REGION_SIZE,
            ))),
            base_region: Arc::new(Mutex::new(MemoryRegion::new(
                MemoryRegionName::Base,
                base_base,
                BASE_REGION_SIZE,
            ))),
            registry: ProcessRegistry::new(),
            next_pid: AtomicU32::new(1),
        }
    }

    /// The emulated physical memory image
    pub fn memory(&self) -> &Arc<MemoryImage> {
        &self.memory
    }

    /// Get a physical region by name
    pub fn region(&self, name: MemoryRegionName) -> &Arc<Mutex<MemoryRegion>> {
        match name {
            MemoryRegionName::Application => &self.application_region,
            MemoryRegionName::System => &self.system_region,
            MemoryRegionName::Base => &self.base_region,
        }
    }

    /// The process registry
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Create and register a new process
    pub fn create_process(&self, name: &str) -> Arc<Process> {
        let id = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let process = Arc::new(Process::new(id, name));
        self.registry
            .register(Arc::clone(&process))
            .expect("fresh process IDs never collide");
        log::debug!("created process {:?} ({})", id, name);
        process
    }

    /// Give `process` a private read/write heap mapping at `addr`.
    ///
    /// Backing storage comes from the application region; the mapped bytes
    /// are zeroed. This is the setup path guest code runs before wrapping
    /// heap memory in kernel objects.
    pub fn heap_allocate(
        &self,
        process: &Arc<Process>,
        addr: VirtAddr,
        size: u32,
    ) -> KernelResult<()> {
        let paddr = self
            .application_region
            .lock()
            .linear_allocate(size)
            .ok_or(crate::KernelError::OutOfMemory)?;
        self.memory.zero(paddr, size);

        let mapped = process
            .vm()
            .write()
            .map_backing_memory(addr, paddr, size, MemoryState::Private);
        if let Err(err) = mapped {
            // Roll the physical allocation back on mapping failure.
            self.application_region.lock().free(ember_memory::Interval::new(
                paddr.as_u32(),
                paddr.as_u32() + size,
            ));
            return Err(err.into());
        }

        process.add_memory_used(size as u64);
        Ok(())
    }
}

impl Default for KernelSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_hal::layout::HEAP_VADDR;
    use ember_memory::VmaPermission;

    #[test]
    fn test_regions_partition_fcram() {
        let kernel = KernelSystem::new();
        let app = kernel.region(MemoryRegionName::Application).lock().size();
        let sys = kernel.region(MemoryRegionName::System).lock().size();
        let base = kernel.region(MemoryRegionName::Base).lock().size();
        assert_eq!(app + sys + base, FCRAM_SIZE);
        assert_eq!(kernel.memory().size(), FCRAM_SIZE);
    }

    #[test]
    fn test_create_process_registers() {
        let kernel = KernelSystem::new();
        let process = kernel.create_process("app");
        assert_eq!(kernel.registry().count(), 1);
        let found = kernel.registry().get(process.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &process));
    }

    #[test]
    fn test_heap_allocate_maps_private_rw() {
        let kernel = KernelSystem::new();
        let process = kernel.create_process("app");
        kernel
            .heap_allocate(&process, VirtAddr::new(HEAP_VADDR), 0x4000)
            .unwrap();

        let vm = process.vm().read();
        let vma = vm.find_vma(VirtAddr::new(HEAP_VADDR)).unwrap();
        assert_eq!(vma.state, MemoryState::Private);
        assert_eq!(vma.permissions, VmaPermission::READ_WRITE);
        assert_eq!(vma.size, 0x4000);
        drop(vm);
        assert_eq!(process.memory_used(), 0x4000);
    }

    #[test]
    fn test_heap_allocate_rolls_back_on_bad_address() {
        let kernel = KernelSystem::new();
        let process = kernel.create_process("app");
        let free_before = kernel.region(MemoryRegionName::Application).lock().free_bytes();

        let result = kernel.heap_allocate(&process, VirtAddr::new(0xFFFF_F000), 0x4000);
        assert!(result.is_err());
        let free_after = kernel.region(MemoryRegionName::Application).lock().free_bytes();
        assert_eq!(free_before, free_after);
    }
}
