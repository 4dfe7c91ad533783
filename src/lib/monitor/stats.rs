use serde::Serializer;
use sysinfo::{Disks, System};

use super::types::SystemStats;
use crate::lib::ports::types::PoolUsage;

const MB: u64 = 1024 * 1024;

pub fn percent<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{:.2}%", value))
}

pub fn megabytes<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{} MB", value))
}

impl SystemStats {
    /// Quarantined ports count as neither allocated nor free.
    pub fn collect(
        sysinfo: &System,
        disks: &Disks,
        running_containers: usize,
        usage: &[PoolUsage],
    ) -> Self {
        let (disk_used, disk_total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
            (
                used + disk.total_space().saturating_sub(disk.available_space()),
                total + disk.total_space(),
            )
        });
        let (allocated_ports, free_ports) =
            usage.iter().fold((0, 0), |(allocated, free), pool| {
                (
                    allocated + pool.bound,
                    free + pool.capacity - pool.bound - pool.quarantined,
                )
            });

        SystemStats {
            cpu_usage: (sysinfo.global_cpu_usage() * 100.0).round() / 100.0,
            total_memory: sysinfo.total_memory() / MB,
            used_memory: sysinfo.used_memory() / MB,
            total_swap: sysinfo.total_swap() / MB,
            used_swap: sysinfo.used_swap() / MB,
            system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
            hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
            total_cpus: sysinfo.cpus().len() as u64,
            disk_usage: if disk_total == 0 {
                0.0
            } else {
                (disk_used as f64 * 100.0 / disk_total as f64) as f32
            },
            running_containers,
            allocated_ports,
            free_ports,
        }
    }
}
