//! System memory usage, polled by the supervisor.

use sysinfo::System;

pub trait MemoryProbe: Send {
    /// Share of physical memory in use, 0–100.
    fn usage_percent(&mut self) -> f32;
}

/// Reads system-wide memory through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn usage_percent(&mut self) -> f32 {
        self.system.refresh_memory();
        usage_percent(self.system.total_memory(), self.system.available_memory())
    }
}

/// `(total - available) / total` as a percentage; 0 when total is unknown.
pub fn usage_percent(total: u64, available: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    (used as f64 / total as f64 * 100.0) as f32
}
