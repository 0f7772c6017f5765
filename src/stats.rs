//! Point-in-time snapshot of the host the worker runs on. Memory, disk and
//! load come from sysinfo; the per-CPU jiffy counters come straight from
//! /proc/stat because the placement scorer needs the raw deltas.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemInfo {
    /// KiB.
    pub mem_total: u64,
    /// KiB.
    pub mem_available: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Bytes.
    pub all: u64,
    pub used: u64,
    pub free: u64,
}

/// Aggregate CPU time counters in jiffies, as reported by the first line of
/// /proc/stat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStat {
    pub id: String,
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub mem_stats: MemInfo,
    pub disk_stats: DiskInfo,
    pub cpu_stats: CpuStat,
    pub load_stats: LoadAvg,
    pub task_count: u64,
}

impl Stats {
    /// Sample the local host.
    pub fn collect() -> Stats {
        let mut sys = System::new();
        sys.refresh_memory();
        let mem_stats = MemInfo {
            mem_total: sys.total_memory() / 1024,
            mem_available: sys.available_memory() / 1024,
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| disks.iter().next());
        let disk_stats = match root {
            Some(disk) => DiskInfo {
                all: disk.total_space(),
                used: disk.total_space() - disk.available_space(),
                free: disk.available_space(),
            },
            None => DiskInfo::default(),
        };

        let cpu_stats = read_cpu_stat().unwrap_or_else(|e| {
            error!(error = %e, "error reading /proc/stat");
            CpuStat::default()
        });

        let load = System::load_average();
        let load_stats = LoadAvg {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        };

        Stats {
            mem_stats,
            disk_stats,
            cpu_stats,
            load_stats,
            task_count: 0,
        }
    }

    pub fn mem_total_kb(&self) -> u64 {
        self.mem_stats.mem_total
    }

    pub fn mem_available_kb(&self) -> u64 {
        self.mem_stats.mem_available
    }

    pub fn mem_used_kb(&self) -> u64 {
        self.mem_stats.mem_total - self.mem_stats.mem_available
    }

    pub fn mem_used_percent(&self) -> u64 {
        if self.mem_stats.mem_total == 0 {
            return 0;
        }
        self.mem_used_kb() * 100 / self.mem_stats.mem_total
    }

    pub fn disk_total(&self) -> u64 {
        self.disk_stats.all
    }

    pub fn disk_free(&self) -> u64 {
        self.disk_stats.free
    }

    pub fn disk_used(&self) -> u64 {
        self.disk_stats.used
    }

    /// Idle jiffies (idle + iowait) accumulated since boot.
    pub fn cpu_idle(&self) -> u64 {
        self.cpu_stats.idle + self.cpu_stats.iowait
    }

    /// Non-idle jiffies accumulated since boot.
    pub fn cpu_busy(&self) -> u64 {
        self.cpu_stats.user
            + self.cpu_stats.nice
            + self.cpu_stats.system
            + self.cpu_stats.irq
            + self.cpu_stats.softirq
            + self.cpu_stats.steal
    }

    /// Fraction of CPU time spent non-idle since boot.
    pub fn cpu_usage(&self) -> f64 {
        let idle = self.cpu_idle();
        let total = idle + self.cpu_busy();
        if total == 0 {
            return 0.0;
        }
        (total - idle) as f64 / total as f64
    }
}

fn read_cpu_stat() -> io::Result<CpuStat> {
    let content = fs::read_to_string("/proc/stat")?;
    parse_cpu_stat(&content)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no aggregate cpu line"))
}

fn parse_cpu_stat(content: &str) -> Option<CpuStat> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let mut fields = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>().unwrap_or(0));
    Some(CpuStat {
        id: "cpu".to_string(),
        user: fields.next()?,
        nice: fields.next()?,
        system: fields.next()?,
        idle: fields.next()?,
        iowait: fields.next().unwrap_or(0),
        irq: fields.next().unwrap_or(0),
        softirq: fields.next().unwrap_or(0),
        steal: fields.next().unwrap_or(0),
        guest: fields.next().unwrap_or(0),
        guest_nice: fields.next().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_usage_is_non_idle_over_total() {
        let stats = Stats {
            cpu_stats: CpuStat {
                user: 100,
                system: 50,
                idle: 800,
                iowait: 50,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!((stats.cpu_usage() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn cpu_usage_of_zero_counters_is_zero() {
        assert_eq!(Stats::default().cpu_usage(), 0.0);
    }

    #[test]
    fn mem_used_is_total_minus_available() {
        let stats = Stats {
            mem_stats: MemInfo {
                mem_total: 1000,
                mem_available: 250,
            },
            ..Default::default()
        };
        assert_eq!(stats.mem_used_kb(), 750);
        assert_eq!(stats.mem_used_percent(), 75);
    }

    #[test]
    fn parses_the_aggregate_cpu_line() {
        let content = "cpu  4705 150 1120 16250 520 29 35 0 0 0\ncpu0 1200 30 300 4000 130 7 9 0 0 0\n";
        let cpu = parse_cpu_stat(content).unwrap();
        assert_eq!(cpu.user, 4705);
        assert_eq!(cpu.idle, 16250);
        assert_eq!(cpu.iowait, 520);
        assert_eq!(cpu.guest_nice, 0);
    }
}
