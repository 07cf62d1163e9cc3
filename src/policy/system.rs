//! Best-effort system snapshot (`cpu_percent`, `memory_percent`, `system_load`)
//! attached to every policy-log entry (§3.5, §4.3). "Best-effort" means a
//! sampling failure never blocks logging — it degrades to zeros.

use sysinfo::System;

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub system_load: f64,
}

/// Cheap, process-wide system sampler. `sysinfo::System::new_all()` followed
/// by an immediate refresh is the only way to get a meaningful CPU reading
/// from a freshly constructed `System` (the first sample is always 0%), so
/// this type is held by the `PolicyLogger` for the lifetime of a run rather
/// than reconstructed per event.
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys }
    }

    pub fn sample(&mut self) -> SystemSnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpu_percent = if self.sys.cpus().is_empty() {
            0.0
        } else {
            (self.sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>()
                / self.sys.cpus().len() as f32) as f64
        };

        let total = self.sys.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.sys.used_memory() as f64 / total as f64) * 100.0
        };

        let system_load = System::load_average().one;

        SystemSnapshot {
            cpu_percent,
            memory_percent,
            system_load,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
