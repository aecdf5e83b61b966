//! Process cpu/memory sampling

use crate::error::{Result, SpinError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// One resource sample for a process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// CPU percentage since the previous sample (or since process start)
    pub cpu: f64,
    /// Resident memory in bytes
    pub memory: u64,
    pub memory_percent: f64,
    /// Seconds since the process started
    pub elapsed_secs: f64,
}

pub trait UsageSampler: Send + Sync {
    fn sample(&self, pid: u32) -> Result<ResourceUsage>;

    /// Drop any per-process state kept between samples
    fn forget(&self, _pid: u32) {}
}

/// Fields of `/proc/<pid>/stat` the sampler needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    /// utime + stime in clock ticks
    cpu_ticks: u64,
    /// Start time in clock ticks after boot
    start_ticks: u64,
    rss_pages: u64,
}

fn parse_stat(contents: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; fields resume after the last ')'
    let after_comm = contents.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Index 0 here is field 3 (state)
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let start_ticks: u64 = fields.get(19)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some(ProcStat {
        cpu_ticks: utime + stime,
        start_ticks,
        rss_pages,
    })
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn parse_uptime_secs(uptime: &str) -> Option<f64> {
    uptime.split_whitespace().next()?.parse().ok()
}

/// Reads usage from `/proc` (Linux only)
pub struct ProcSampler {
    clock_ticks: f64,
    page_size: u64,
    previous: Mutex<HashMap<u32, (u64, Instant)>>,
}

impl ProcSampler {
    pub fn new() -> Self {
        #[cfg(unix)]
        let (clock_ticks, page_size) = {
            // SAFETY: sysconf has no preconditions
            let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            (
                if ticks > 0 { ticks as f64 } else { 100.0 },
                if page > 0 { page as u64 } else { 4096 },
            )
        };
        #[cfg(not(unix))]
        let (clock_ticks, page_size) = (100.0, 4096);

        Self {
            clock_ticks,
            page_size,
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn read_proc(path: &str) -> Result<String> {
        std::fs::read_to_string(path).map_err(SpinError::from)
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for ProcSampler {
    fn sample(&self, pid: u32) -> Result<ResourceUsage> {
        let stat_raw = Self::read_proc(&format!("/proc/{}/stat", pid))
            .map_err(|_| SpinError::NotFound(format!("process {}", pid)))?;
        let stat = parse_stat(&stat_raw)
            .ok_or_else(|| SpinError::store(format!("unparseable /proc/{}/stat", pid)))?;

        let uptime = Self::read_proc("/proc/uptime")
            .ok()
            .and_then(|u| parse_uptime_secs(&u))
            .unwrap_or(0.0);
        let elapsed_secs = (uptime - stat.start_ticks as f64 / self.clock_ticks).max(0.0);

        let now = Instant::now();
        let cpu = {
            let mut previous = self.previous.lock();
            let cpu = match previous.get(&pid) {
                Some((ticks, at)) if stat.cpu_ticks >= *ticks => {
                    let wall = now.duration_since(*at).as_secs_f64();
                    let used = (stat.cpu_ticks - ticks) as f64 / self.clock_ticks;
                    if wall > 0.0 { used / wall * 100.0 } else { 0.0 }
                }
                _ if elapsed_secs > 0.0 => {
                    stat.cpu_ticks as f64 / self.clock_ticks / elapsed_secs * 100.0
                }
                _ => 0.0,
            };
            previous.insert(pid, (stat.cpu_ticks, now));
            cpu
        };

        let memory = stat.rss_pages * self.page_size;
        let memory_percent = Self::read_proc("/proc/meminfo")
            .ok()
            .and_then(|m| parse_mem_total_kb(&m))
            .filter(|total| *total > 0)
            .map(|total_kb| memory as f64 / (total_kb * 1024) as f64 * 100.0)
            .unwrap_or(0.0);

        Ok(ResourceUsage {
            cpu,
            memory,
            memory_percent,
            elapsed_secs,
        })
    }

    fn forget(&self, pid: u32) {
        self.previous.lock().remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (node (worker) x) S 1 1234 1234 0 -1 4194560 5000 0 12 0 250 50 0 0 20 0 11 0 98765 1200000000 20480 18446744073709551615 1 1 0 0 0 0 0 4096 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat_with_tricky_comm() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.cpu_ticks, 300);
        assert_eq!(stat.start_ticks, 98765);
        assert_eq!(stat.rss_pages, 20480);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("1234 (node) S 1 2 3").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_meminfo_and_uptime() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total_kb(meminfo), Some(16318480));
        assert_eq!(parse_uptime_secs("35466.12 140000.50\n"), Some(35466.12));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_self() {
        let sampler = ProcSampler::new();
        let pid = std::process::id();
        let first = sampler.sample(pid).unwrap();
        assert!(first.memory > 0);
        assert!(first.cpu >= 0.0);

        let second = sampler.sample(pid).unwrap();
        assert!(second.elapsed_secs >= first.elapsed_secs);
        sampler.forget(pid);
    }

    #[test]
    fn test_sample_missing_process() {
        let sampler = ProcSampler::new();
        let err = sampler.sample(u32::MAX).unwrap_err();
        assert!(matches!(err, SpinError::NotFound(_)));
    }
}
