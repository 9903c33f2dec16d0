use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Memory counters the executor measures itself.
pub const MEASURED_MEM_STATS: &[&str] = &["RSS", "Swap"];
/// CPU counters the executor measures itself.
pub const MEASURED_CPU_STATS: &[&str] = &["System Mode", "User Mode", "Percent"];

/// Rate estimator for one cumulative CPU-time counter.
///
/// Keeps the previous sample and its timestamp; feeding the next cumulative
/// value yields the usage percentage over the elapsed interval.
#[derive(Debug, Clone, Default)]
pub struct CpuStats {
    prev_cpu_time_ns: f64,
    prev_at: Option<Instant>,
}

impl CpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage percent since the previous sample; 0.0 on the first one.
    pub fn percent(&mut self, cpu_time_ns: f64) -> f64 {
        self.percent_at(cpu_time_ns, Instant::now())
    }

    fn percent_at(&mut self, cpu_time_ns: f64, now: Instant) -> f64 {
        let pct = match self.prev_at {
            Some(prev) => {
                let elapsed_ns = now.duration_since(prev).as_nanos() as f64;
                if elapsed_ns > 0.0 {
                    ((cpu_time_ns - self.prev_cpu_time_ns).max(0.0) / elapsed_ns) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.prev_cpu_time_ns = cpu_time_ns;
        self.prev_at = Some(now);
        pct
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub rss: u64,
    pub swap: u64,
    pub measured: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuUsage {
    pub system_mode: f64,
    pub user_mode: f64,
    pub percent: f64,
    pub measured: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuUsage,
}

/// Aggregated usage of the whole task at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskResourceUsage {
    pub resource_usage: ResourceUsage,
    /// Wall clock, nanoseconds since the epoch.
    pub timestamp_ns: i64,
    /// Per-pid breakdown, keyed by the pid rendered as a string.
    pub pids: HashMap<String, ResourceUsage>,
}

/// A supervised pid and its per-counter rate estimators.
///
/// The estimators survive process-table rescans so that each Stats call sees
/// percentages computed against the previous sample of the same pid.
#[derive(Debug)]
pub struct PidRecord {
    pub pid: u32,
    total: CpuStats,
    user: CpuStats,
    system: CpuStats,
}

impl PidRecord {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            total: CpuStats::new(),
            user: CpuStats::new(),
            system: CpuStats::new(),
        }
    }

    /// Sample the pid's current memory and CPU usage.
    ///
    /// `None` means the process disappeared; callers skip it silently.
    pub fn sample(&mut self) -> Option<ResourceUsage> {
        let proc_root = Path::new("/proc");
        let mem = read_memory(proc_root, self.pid);
        let cpu = read_cpu_times(proc_root, self.pid);
        if mem.is_none() && cpu.is_none() {
            return None;
        }

        let mut usage = ResourceUsage::default();
        if let Some((rss, swap)) = mem {
            usage.memory_stats = MemoryStats {
                rss,
                swap,
                measured: measured(MEASURED_MEM_STATS),
            };
        }
        if let Some((user_ns, system_ns)) = cpu {
            usage.cpu_stats = CpuUsage {
                system_mode: self.system.percent(system_ns),
                user_mode: self.user.percent(user_ns),
                percent: self.total.percent(user_ns + system_ns),
                measured: measured(MEASURED_CPU_STATS),
            };
        }
        Some(usage)
    }
}

/// Sum the per-pid usage into the task total and stamp it.
pub fn aggregate(pid_stats: HashMap<String, ResourceUsage>) -> TaskResourceUsage {
    let mut total = ResourceUsage {
        memory_stats: MemoryStats {
            rss: 0,
            swap: 0,
            measured: measured(MEASURED_MEM_STATS),
        },
        cpu_stats: CpuUsage {
            system_mode: 0.0,
            user_mode: 0.0,
            percent: 0.0,
            measured: measured(MEASURED_CPU_STATS),
        },
    };
    for usage in pid_stats.values() {
        total.memory_stats.rss += usage.memory_stats.rss;
        total.memory_stats.swap += usage.memory_stats.swap;
        total.cpu_stats.system_mode += usage.cpu_stats.system_mode;
        total.cpu_stats.user_mode += usage.cpu_stats.user_mode;
        total.cpu_stats.percent += usage.cpu_stats.percent;
    }
    TaskResourceUsage {
        resource_usage: total,
        timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        pids: pid_stats,
    }
}

fn measured(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Resident and swapped-out bytes from `/proc/<pid>/status`.
fn read_memory(proc_root: &Path, pid: u32) -> Option<(u64, u64)> {
    let status = fs::read_to_string(proc_root.join(pid.to_string()).join("status")).ok()?;
    let mut rss = 0u64;
    let mut swap = 0u64;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kb(rest)?;
        } else if let Some(rest) = line.strip_prefix("VmSwap:") {
            swap = parse_kb(rest)?;
        }
    }
    Some((rss, swap))
}

fn parse_kb(rest: &str) -> Option<u64> {
    let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kb * 1024)
}

/// Cumulative (user, system) CPU time in nanoseconds from `/proc/<pid>/stat`.
fn read_cpu_times(proc_root: &Path, pid: u32) -> Option<(f64, f64)> {
    let stat = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is stat field 3 (state); utime/stime are fields 14/15
    let utime_ticks: u64 = fields.get(11)?.parse().ok()?;
    let stime_ticks: u64 = fields.get(12)?.parse().ok()?;
    let hz = clock_ticks_per_second()?;
    let tick_ns = 1_000_000_000.0 / hz;
    Some((utime_ticks as f64 * tick_ns, stime_ticks as f64 * tick_ns))
}

fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 {
        None
    } else {
        Some(v as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_sample_reports_zero_percent() {
        let mut cs = CpuStats::new();
        assert_eq!(cs.percent_at(1_000_000.0, Instant::now()), 0.0);
    }

    #[test]
    fn percent_is_relative_to_the_elapsed_interval() {
        let mut cs = CpuStats::new();
        let t0 = Instant::now();
        cs.percent_at(0.0, t0);
        // half a second of cpu over one second of wall clock
        let pct = cs.percent_at(500_000_000.0, t0 + Duration::from_secs(1));
        assert!((pct - 50.0).abs() < 1e-6);
        // counter stagnates: zero over the next interval
        let pct = cs.percent_at(500_000_000.0, t0 + Duration::from_secs(2));
        assert!((pct - 0.0).abs() < 1e-6);
    }

    #[test]
    fn counter_going_backwards_clamps_to_zero() {
        let mut cs = CpuStats::new();
        let t0 = Instant::now();
        cs.percent_at(1_000_000.0, t0);
        let pct = cs.percent_at(0.0, t0 + Duration::from_secs(1));
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn aggregate_sums_across_pids() {
        let usage = |rss, pct: f64| ResourceUsage {
            memory_stats: MemoryStats {
                rss,
                swap: 10,
                measured: measured(MEASURED_MEM_STATS),
            },
            cpu_stats: CpuUsage {
                system_mode: 1.0,
                user_mode: 2.0,
                percent: pct,
                measured: measured(MEASURED_CPU_STATS),
            },
        };
        let mut pid_stats = HashMap::new();
        pid_stats.insert("100".to_string(), usage(1000, 25.0));
        pid_stats.insert("101".to_string(), usage(500, 5.0));

        let total = aggregate(pid_stats);
        assert_eq!(total.resource_usage.memory_stats.rss, 1500);
        assert_eq!(total.resource_usage.memory_stats.swap, 20);
        assert!((total.resource_usage.cpu_stats.percent - 30.0).abs() < 1e-6);
        assert!((total.resource_usage.cpu_stats.user_mode - 4.0).abs() < 1e-6);
        assert!(total.timestamp_ns > 0);
        assert_eq!(total.pids.len(), 2);
    }

    #[test]
    fn measured_names_form_the_stats_contract() {
        assert_eq!(MEASURED_MEM_STATS, ["RSS", "Swap"]);
        assert_eq!(MEASURED_CPU_STATS, ["System Mode", "User Mode", "Percent"]);
    }

    #[test]
    fn sampling_our_own_pid_works() {
        let mut rec = PidRecord::new(std::process::id());
        let usage = rec.sample().expect("own pid is alive");
        assert!(usage.memory_stats.rss > 0);
        assert_eq!(usage.memory_stats.measured, measured(MEASURED_MEM_STATS));
    }

    #[test]
    fn sampling_a_dead_pid_returns_none() {
        // pid 0 has no /proc entry
        let mut rec = PidRecord::new(0);
        assert!(rec.sample().is_none());
    }
}
