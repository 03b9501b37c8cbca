//! Host resource sampling for the governance loop.

use sysinfo::System;

/// One CPU/memory reading, both as percentages.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

/// Wrapper around a [`sysinfo::System`] that is refreshed on every sample.
///
/// CPU usage is computed from the delta since the previous refresh, so the
/// first reading after startup reports zero; the governance loop's rolling
/// averages absorb that.
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Refresh CPU and memory state and read the current usage.
    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_pct = f64::from(self.system.global_cpu_info().cpu_usage());
        let total = self.system.total_memory();
        let mem_pct = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        ResourceSample { cpu_pct, mem_pct }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
