/// Per-process polling backend built on sysinfo. Needs no privilege.
use super::cgroup::{host_total_memory, percent_of};
use super::{SampleRead, Sampler};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

pub struct PollingSampler {
    pid: Pid,
    sys: System,
    total_memory: u64,
    primed: bool,
}

impl PollingSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            sys: System::new(),
            total_memory: host_total_memory(),
            primed: false,
        }
    }
}

impl Sampler for PollingSampler {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn sample(&mut self) -> SampleRead {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let Some(process) = self.sys.process(self.pid) else {
            return SampleRead::Exited;
        };
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return SampleRead::Exited;
        }

        // CPU usage is a delta against the previous refresh.
        if !self.primed {
            self.primed = true;
            return SampleRead::Skipped("priming cpu counter".into());
        }
        let cpu = process.cpu_usage();
        if !cpu.is_finite() {
            return SampleRead::Skipped(format!("unreadable cpu usage for pid {}", self.pid));
        }

        SampleRead::Sample {
            cpu_percent: f64::from(cpu),
            mem_percent: percent_of(process.memory(), self.total_memory),
        }
    }
}
