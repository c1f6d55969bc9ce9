//! # Process Management
//!
//! Emulated process descriptors and the registry kernel objects resolve
//! weak owner references through.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use ember_hal::layout::ADDRESS_SPACE_END;
use ember_memory::AddressSpace;
use spin::RwLock;

use crate::{KernelError, KernelResult};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

/// An emulated process.
///
/// Kernel objects hold `Weak<Process>` back-references; the registry holds
/// the owning `Arc`, so a process "dies" for kernel objects exactly when it
/// is unregistered and its last strong reference drops.
pub struct Process {
    /// Process ID
    id: ProcessId,
    /// Process name (diagnostics)
    name: String,
    /// Virtual address space
    vm: RwLock<AddressSpace>,
    /// Bytes of physical memory accounted to this process
    memory_used: AtomicU64,
}

impl Process {
    /// Create a new process with an empty address space
    pub fn new(id: ProcessId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            vm: RwLock::new(AddressSpace::new(ADDRESS_SPACE_END)),
            memory_used: AtomicU64::new(0),
        }
    }

    /// Get process ID
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Get process name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the process address space
    pub fn vm(&self) -> &RwLock<AddressSpace> {
        &self.vm
    }

    /// Bytes of physical memory accounted to this process
    pub fn memory_used(&self) -> u64 {
        self.memory_used.load(Ordering::Relaxed)
    }

    /// Account additional physical memory to this process
    pub fn add_memory_used(&self, bytes: u64) {
        self.memory_used.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Process registry
pub struct ProcessRegistry {
    /// All live processes
    processes: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
}

impl ProcessRegistry {
    /// Create a new registry
    pub const fn new() -> Self {
        Self {
            processes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a process
    pub fn register(&self, process: Arc<Process>) -> KernelResult<()> {
        let id = process.id();
        let mut processes = self.processes.write();

        if processes.contains_key(&id) {
            return Err(KernelError::InvalidCombination);
        }

        processes.insert(id, process);
        Ok(())
    }

    /// Unregister a process, dropping the registry's strong reference
    pub fn unregister(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.write().remove(&id)
    }

    /// Get a process
    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&id).cloned()
    }

    /// Get process count
    pub fn count(&self) -> usize {
        self.processes.read().len()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = ProcessRegistry::new();
        let process = Arc::new(Process::new(ProcessId(1), "app"));
        registry.register(Arc::clone(&process)).unwrap();

        assert_eq!(registry.count(), 1);
        let found = registry.get(ProcessId(1)).unwrap();
        assert!(Arc::ptr_eq(&found, &process));
        assert_eq!(found.name(), "app");
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ProcessRegistry::new();
        registry
            .register(Arc::new(Process::new(ProcessId(7), "a")))
            .unwrap();
        let result = registry.register(Arc::new(Process::new(ProcessId(7), "b")));
        assert_eq!(result, Err(KernelError::InvalidCombination));
    }

    #[test]
    fn test_unregister_kills_weak_references() {
        let registry = ProcessRegistry::new();
        let process = Arc::new(Process::new(ProcessId(2), "svc"));
        let weak = Arc::downgrade(&process);
        registry.register(process).unwrap();

        // Registry holds the only strong reference now.
        assert!(weak.upgrade().is_some());
        registry.unregister(ProcessId(2));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_memory_accounting() {
        let process = Process::new(ProcessId(3), "acct");
        assert_eq!(process.memory_used(), 0);
        process.add_memory_used(0x1000);
        process.add_memory_used(0x2000);
        assert_eq!(process.memory_used(), 0x3000);
    }
}
