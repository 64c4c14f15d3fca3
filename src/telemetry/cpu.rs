//! CPU usage and temperature sampling from procfs/sysfs.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuInfo {
    pub temperature_celsius: f32,
    pub usage_percent: f32,
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self {
            temperature_celsius: -1.0,
            usage_percent: -1.0,
        }
    }
}

/// Aggregate jiffy counters from the `cpu ` line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Parse the first line of /proc/stat. Returns `None` for anything that is
/// not a well-formed aggregate cpu line.
pub fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 8 {
        return None;
    }
    Some(CpuTimes {
        total: values[..8].iter().sum(),
        idle: values[3],
    })
}

/// Usage percentage between two samples; `None` when no time has passed.
pub fn usage_between(prev: CpuTimes, current: CpuTimes) -> Option<f32> {
    let total_diff = current.total.checked_sub(prev.total)?;
    if total_diff == 0 {
        return None;
    }
    let idle_diff = current.idle.saturating_sub(prev.idle);
    Some(100.0 * (1.0 - idle_diff as f32 / total_diff as f32))
}

/// millidegrees as exposed by thermal_zone0 → °C.
pub fn parse_thermal_millic(content: &str) -> Option<f32> {
    content.trim().parse::<i32>().ok().map(|m| m as f32 / 1000.0)
}

/// Stateful sampler; readings are cached for 500 ms since back-to-back
/// usage deltas are meaningless.
pub struct CpuSampler {
    cached: CpuInfo,
    last_times: Option<CpuTimes>,
    last_sample: Option<Instant>,
}

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler {
    pub fn new() -> Self {
        Self {
            cached: CpuInfo::default(),
            last_times: None,
            last_sample: None,
        }
    }

    pub fn sample(&mut self) -> CpuInfo {
        if let Some(last) = self.last_sample {
            if last.elapsed() < MIN_SAMPLE_INTERVAL {
                return self.cached;
            }
        }

        if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
            if let Some(times) = parse_proc_stat(&stat) {
                if let Some(prev) = self.last_times {
                    if let Some(usage) = usage_between(prev, times) {
                        self.cached.usage_percent = usage;
                    }
                }
                self.last_times = Some(times);
            }
        }

        // Zone 0 is the CPU on the supported boards; zone 1 is the NPU.
        if let Ok(temp) = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp") {
            if let Some(celsius) = parse_thermal_millic(&temp) {
                self.cached.temperature_celsius = celsius;
            }
        }

        self.last_sample = Some(Instant::now());
        self.cached
    }
}
