//! Host snapshots for the `snapshot` envelope

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount: String,
    pub fs: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub uptime_sec: u64,
    pub load_avg: [f64; 3],
    pub cpu_usage_percent: f32,
    pub cpu_count: usize,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub disks: Vec<DiskUsage>,
    pub collected_at: i64,
}

/// Something that can describe the host; blocking
pub trait SnapshotSource: Send + Sync {
    fn collect(&self) -> Snapshot;

    fn uptime_sec(&self) -> u64 {
        System::uptime()
    }
}

/// sysinfo-backed source; keeps one `System` so CPU usage is a delta between calls
pub struct SystemSnapshots {
    hostname: String,
    system: Mutex<System>,
}

impl SystemSnapshots {
    pub fn new(hostname: impl Into<String>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            hostname: hostname.into(),
            system: Mutex::new(system),
        }
    }
}

impl SnapshotSource for SystemSnapshots {
    fn collect(&self) -> Snapshot {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_cpu();
        system.refresh_memory();

        let load = System::load_average();
        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|d| DiskUsage {
                mount: d.mount_point().display().to_string(),
                fs: d.file_system().to_string_lossy().into_owned(),
                total_bytes: d.total_space(),
                available_bytes: d.available_space(),
            })
            .collect();

        Snapshot {
            hostname: self.hostname.clone(),
            os: System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
            kernel: System::kernel_version().unwrap_or_default(),
            uptime_sec: System::uptime(),
            load_avg: [load.one, load.five, load.fifteen],
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            cpu_count: system.cpus().len(),
            mem_total_bytes: system.total_memory(),
            mem_used_bytes: system.used_memory(),
            swap_total_bytes: system.total_swap(),
            swap_used_bytes: system.used_swap(),
            disks,
            collected_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_alias_and_memory() {
        let snapshots = SystemSnapshots::new("edge-01");
        let snap = snapshots.collect();
        assert_eq!(snap.hostname, "edge-01");
        assert!(snap.mem_total_bytes > 0);
        assert!(snap.cpu_count > 0);
        assert!(snap.collected_at > 0);
    }
}
