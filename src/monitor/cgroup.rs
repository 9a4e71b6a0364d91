/// cgroup v2 accounting backend.
///
/// The workload is moved into a dedicated group; CPU usage comes from the
/// cumulative `usage_usec` counter in `cpu.stat`, memory from `memory.current`.
/// Creating a group needs privilege, so availability is probed once and cached
/// for the life of the process.
use super::{SampleRead, Sampler};
use crate::config::MonitorConfig;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

static GROUP_ACCOUNTING: OnceLock<bool> = OnceLock::new();

/// Whether this host lets us create accounting groups under `root`.
///
/// The first call probes; every later call returns the cached answer, even
/// for a different root.
pub fn group_accounting_available(root: &Path) -> bool {
    *GROUP_ACCOUNTING.get_or_init(|| {
        let available = probe(root);
        tracing::info!(root = %root.display(), available, "probed cgroup accounting");
        available
    })
}

/// Create and immediately remove a throwaway group.
fn probe(root: &Path) -> bool {
    if !root.join("cgroup.controllers").exists() {
        return false;
    }
    let probe_dir = root.join(format!("bench_sentinel_probe_{}", std::process::id()));
    match std::fs::create_dir(&probe_dir) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&probe_dir);
            true
        }
        Err(e) => {
            tracing::debug!(error = %e, "cgroup probe create failed");
            false
        }
    }
}

/// Why group accounting could not be set up for this run.
#[derive(Debug)]
pub struct MonitorUnavailable {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for MonitorUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot use cgroup {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for MonitorUnavailable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Samples one accounting group. Removes the group when dropped.
pub struct CgroupSampler {
    dir: PathBuf,
    total_memory: u64,
    last_usage: Option<(Instant, u64)>,
}

impl CgroupSampler {
    /// Create the group, apply configured limits, and move `pid` into it.
    pub fn attach(config: &MonitorConfig, pid: u32) -> Result<Self, MonitorUnavailable> {
        let dir = config.cgroup_root.join(&config.cgroup_name);
        std::fs::create_dir_all(&dir).map_err(|e| MonitorUnavailable {
            path: dir.clone(),
            source: e,
        })?;

        let sampler = Self {
            dir,
            total_memory: host_total_memory(),
            last_usage: None,
        };
        sampler.apply_limits(config);

        let procs = sampler.dir.join("cgroup.procs");
        std::fs::write(&procs, pid.to_string()).map_err(|e| MonitorUnavailable {
            path: procs,
            source: e,
        })?;
        tracing::info!(pid, group = %sampler.dir.display(), "workload attached to cgroup");
        Ok(sampler)
    }

    fn apply_limits(&self, config: &MonitorConfig) {
        let mut limits = Vec::new();
        if let Some(cores) = config.cpu_limit_cores {
            let period = 100_000u64;
            let quota = (cores * period as f64).round() as u64;
            limits.push(("cpu.max", format!("{quota} {period}")));
        }
        if let Some(bytes) = config.memory_limit_bytes {
            limits.push(("memory.max", bytes.to_string()));
            limits.push(("memory.swap.max", bytes.to_string()));
        }
        for (file, value) in limits {
            if let Err(e) = std::fs::write(self.dir.join(file), &value) {
                tracing::warn!(file, value = %value, error = %e, "failed to set cgroup limit");
            }
        }
    }

    fn read(&self, file: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.dir.join(file))
    }
}

impl Sampler for CgroupSampler {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn sample(&mut self) -> SampleRead {
        match self.read("cgroup.procs") {
            Ok(procs) if procs.trim().is_empty() => return SampleRead::Exited,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SampleRead::Exited,
            Err(e) => return SampleRead::Skipped(format!("cgroup.procs: {e}")),
        }

        let usage = match self.read("cpu.stat").map(|s| parse_usage_usec(&s)) {
            Ok(Some(usage)) => usage,
            Ok(None) => return SampleRead::Skipped("cpu.stat has no usage_usec".into()),
            Err(e) => return SampleRead::Skipped(format!("cpu.stat: {e}")),
        };
        let memory: u64 = match self.read("memory.current").map(|s| s.trim().parse()) {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return SampleRead::Skipped(format!("memory.current: {e}")),
            Err(e) => return SampleRead::Skipped(format!("memory.current: {e}")),
        };

        let now = Instant::now();
        let previous = self.last_usage.replace((now, usage));
        let Some((then, prev_usage)) = previous else {
            return SampleRead::Skipped("priming cpu counter".into());
        };
        let wall_usec = now.duration_since(then).as_micros() as f64;
        if wall_usec <= 0.0 {
            return SampleRead::Skipped("no time elapsed".into());
        }

        SampleRead::Sample {
            cpu_percent: usage.saturating_sub(prev_usage) as f64 / wall_usec * 100.0,
            mem_percent: percent_of(memory, self.total_memory),
        }
    }
}

impl Drop for CgroupSampler {
    fn drop(&mut self) {
        // Fails with EBUSY while the workload is still inside; the next
        // attach reuses the same group.
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            tracing::debug!(group = %self.dir.display(), error = %e, "cgroup not removed");
        }
    }
}

fn parse_usage_usec(cpu_stat: &str) -> Option<u64> {
    cpu_stat.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

pub(super) fn host_total_memory() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

pub(super) fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}
