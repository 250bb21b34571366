//! Host memory introspection for admission control.
//!
//! The loader compares a backend's per-model memory estimate against
//! [`SystemMemory::available_bytes`] before committing a slot.  The sysinfo
//! implementation is used in production; [`FixedMemory`] makes admission
//! deterministic in tests.

use std::sync::Mutex;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Read-only view of host memory headroom.
pub trait SystemMemory: Send + Sync {
    /// Bytes of RAM currently available for new allocations.
    fn available_bytes(&self) -> u64;

    /// Total physical RAM in bytes.
    fn total_bytes(&self) -> u64;
}

/// [`SystemMemory`] backed by the `sysinfo` crate.  Each read refreshes the
/// memory counters; callers receive copies, never live references.
pub struct SysinfoMemory {
    system: Mutex<System>,
}

impl SysinfoMemory {
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
        Self {
            system: Mutex::new(System::new_with_specifics(refresh)),
        }
    }
}

impl Default for SysinfoMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for SysinfoMemory {
    fn available_bytes(&self) -> u64 {
        let mut sys = self.system.lock().expect("memory info poisoned");
        sys.refresh_memory();
        sys.available_memory()
    }

    fn total_bytes(&self) -> u64 {
        let mut sys = self.system.lock().expect("memory info poisoned");
        sys.refresh_memory();
        sys.total_memory()
    }
}

/// Fixed-value [`SystemMemory`] for tests.
#[derive(Debug, Clone)]
pub struct FixedMemory {
    pub available: u64,
    pub total: u64,
}

impl SystemMemory for FixedMemory {
    fn available_bytes(&self) -> u64 {
        self.available
    }

    fn total_bytes(&self) -> u64 {
        self.total
    }
}
