//! Resource sampling for the dashboard's CPU and memory gauges

use std::fs;
use std::sync::{Mutex, PoisonError};

/// CPU and memory usage percentages
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_used: f64,
    pub memory_used: f64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Aggregate CPU time counters from the `cpu` line of `/proc/stat`, in ticks
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Reads `/proc/stat` and `/proc/meminfo`; reports zero where they are unavailable
///
/// CPU usage covers the time since the previous sample, or since boot on the
/// first one.
#[derive(Debug, Default)]
pub struct SystemSampler {
    previous: Mutex<CpuTimes>,
}

impl SystemSampler {
    fn cpu_used(&self) -> Option<f64> {
        let current = cpu_times_from_stat(&fs::read_to_string("/proc/stat").ok()?)?;
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let used = cpu_percent_between(*previous, current);
        *previous = current;
        used
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> ResourceUsage {
        let cpu_used = self.cpu_used().unwrap_or(0.0);
        let memory_used = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| memory_percent_from_meminfo(&s))
            .unwrap_or(0.0);

        ResourceUsage {
            cpu_used,
            memory_used,
        }
    }
}

/// Always reports the same usage
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedSampler(pub ResourceUsage);

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}

/// Idle and total ticks summed over all CPUs; iowait counts as idle
fn cpu_times_from_stat(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse::<u64>)
        .collect::<Result<_, _>>()
        .ok()?;
    if ticks.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user
    let idle = ticks[3] + ticks.get(4).copied().unwrap_or(0);
    let total = ticks.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

/// Share of non-idle ticks between two readings
fn cpu_percent_between(before: CpuTimes, after: CpuTimes) -> Option<f64> {
    let total = after.total.checked_sub(before.total)?;
    let idle = after.idle.checked_sub(before.idle)?;
    if total == 0 {
        return None;
    }
    let busy = total.saturating_sub(idle) as f64 / total as f64 * 100.0;
    Some(round2(busy.clamp(0.0, 100.0)))
}

fn memory_percent_from_meminfo(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(round2(((total - available) / total * 100.0).clamp(0.0, 100.0)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
