//! Host Memory Probe
//!
//! Reports the memory ceiling the process can actually use: sysinfo's total
//! system memory, lowered to the cgroup limit when running in a container.
//! The permutation test materializes the whole non-matching sample and checks
//! this ceiling before its first run.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use sysinfo::System;

pub const MB: u64 = 1024 * 1024;

/// Memory ceiling probe in MB. Injectable so tests do not depend on the host.
pub type HeapProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Probe backed by `available_heap_mb`.
pub fn system_heap_probe() -> HeapProbe {
    Arc::new(available_heap_mb)
}

/// Fixed-value probe.
pub fn fixed_heap_probe(mb: u64) -> HeapProbe {
    Arc::new(move || mb)
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemMemory {
    pub total_bytes: u64,
    /// cgroup memory limit, when one applies.
    pub cgroup_limit_bytes: Option<u64>,
}

impl SystemMemory {
    /// Usable ceiling: total memory bounded by the cgroup limit.
    pub fn ceiling_bytes(&self) -> u64 {
        match self.cgroup_limit_bytes {
            Some(limit) if limit > 0 => limit.min(self.total_bytes),
            _ => self.total_bytes,
        }
    }
}

/// Current memory figures. The `System` handle is cached; creating it is
/// expensive.
pub fn system_memory() -> SystemMemory {
    static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    let mut sys = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new())).lock();
    sys.refresh_memory();

    SystemMemory {
        total_bytes: sys.total_memory(),
        cgroup_limit_bytes: sys.cgroup_limits().map(|l| l.total_memory),
    }
}

/// Memory ceiling in MB.
pub fn available_heap_mb() -> u64 {
    system_memory().ceiling_bytes() / MB
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
