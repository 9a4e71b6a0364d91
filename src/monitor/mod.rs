//! Resource accounting for a workload process.
//!
//! A [`ResourceMonitor`] drives a [`Sampler`] on a background task at a fixed
//! interval and keeps every reading in a shared buffer. Two samplers satisfy
//! the contract: cgroup accounting (needs privilege, probed once per process)
//! and per-process polling through sysinfo.

pub mod cgroup;
pub mod polling;

use crate::config::MonitorConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Averaged CPU and memory utilization over some window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub avg_cpu_percent: f64,
    pub avg_mem_percent: f64,
    pub samples: usize,
}

/// Outcome of one sampling tick.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleRead {
    Sample { cpu_percent: f64, mem_percent: f64 },
    /// This tick produced nothing usable; sampling continues.
    Skipped(String),
    /// The target is gone; sampling ends.
    Exited,
}

/// One backend's way of reading utilization.
pub trait Sampler: Send + 'static {
    fn name(&self) -> &'static str;
    fn sample(&mut self) -> SampleRead;
}

#[derive(Debug, Clone, Copy)]
struct ResourceSample {
    at: Instant,
    cpu_percent: f64,
    mem_percent: f64,
}

/// Append-only sample log shared between the sampler task and the monitor.
#[derive(Debug, Clone, Default)]
struct SampleBuffer(Arc<Mutex<Vec<ResourceSample>>>);

impl SampleBuffer {
    fn push(&self, sample: ResourceSample) {
        if let Ok(mut samples) = self.0.lock() {
            samples.push(sample);
        }
    }

    fn average_since(&self, since: Option<Instant>) -> ResourceSnapshot {
        let Ok(samples) = self.0.lock() else {
            return ResourceSnapshot::default();
        };
        let mut snap = ResourceSnapshot::default();
        for s in samples.iter().filter(|s| since.map_or(true, |t| s.at >= t)) {
            snap.avg_cpu_percent += s.cpu_percent;
            snap.avg_mem_percent += s.mem_percent;
            snap.samples += 1;
        }
        if snap.samples > 0 {
            snap.avg_cpu_percent /= snap.samples as f64;
            snap.avg_mem_percent /= snap.samples as f64;
        }
        snap
    }
}

/// Background utilization sampling for one attempt.
///
/// Dropping the monitor aborts sampling; [`ResourceMonitor::stop`] is the
/// orderly path and returns the overall average.
pub struct ResourceMonitor {
    buffer: SampleBuffer,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    backend: &'static str,
}

impl ResourceMonitor {
    /// Pick a backend for `pid` and start sampling it.
    ///
    /// Cgroup accounting is used when the host supports it; any failure to set
    /// it up degrades to polling. Without a pid the monitor records nothing.
    pub fn start(config: &MonitorConfig, pid: Option<u32>) -> Self {
        let Some(pid) = pid else {
            return Self::idle();
        };

        let sampler: Box<dyn Sampler> = if cgroup::group_accounting_available(&config.cgroup_root)
        {
            match cgroup::CgroupSampler::attach(config, pid) {
                Ok(sampler) => Box::new(sampler),
                Err(unavailable) => {
                    tracing::warn!(pid, reason = %unavailable, "cgroup accounting unavailable, polling instead");
                    Box::new(polling::PollingSampler::new(pid))
                }
            }
        } else {
            Box::new(polling::PollingSampler::new(pid))
        };
        Self::start_with(sampler, config.sample_interval())
    }

    /// Start sampling with an explicit sampler.
    pub fn start_with(sampler: Box<dyn Sampler>, interval: Duration) -> Self {
        let buffer = SampleBuffer::default();
        let (stop_tx, stop_rx) = oneshot::channel();
        let backend = sampler.name();
        tracing::debug!(backend, interval_ms = interval.as_millis() as u64, "resource monitor started");
        let task = tokio::spawn(run_sampler(sampler, interval, buffer.clone(), stop_rx));
        Self {
            buffer,
            stop_tx: Some(stop_tx),
            task: Some(task),
            backend,
        }
    }

    /// A monitor with nothing to observe; every snapshot is empty.
    pub fn idle() -> Self {
        Self {
            buffer: SampleBuffer::default(),
            stop_tx: None,
            task: None,
            backend: "none",
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Average over the trailing `last` window; sampling keeps running.
    pub fn snapshot(&self, last: Duration) -> ResourceSnapshot {
        let since = Instant::now().checked_sub(last);
        self.buffer.average_since(since)
    }

    /// Halt sampling and return the average over everything collected.
    /// Later calls return the same figures.
    pub async fn stop(&mut self) -> ResourceSnapshot {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "resource sampler task failed");
            }
        }
        let snap = self.buffer.average_since(None);
        tracing::debug!(
            backend = self.backend,
            avg_cpu = snap.avg_cpu_percent,
            avg_mem = snap.avg_mem_percent,
            samples = snap.samples,
            "resource monitor stopped"
        );
        snap
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_sampler(
    mut sampler: Box<dyn Sampler>,
    interval: Duration,
    buffer: SampleBuffer,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => match sampler.sample() {
                SampleRead::Sample { cpu_percent, mem_percent } => buffer.push(ResourceSample {
                    at: Instant::now(),
                    cpu_percent,
                    mem_percent,
                }),
                SampleRead::Skipped(reason) => {
                    tracing::debug!(backend = sampler.name(), %reason, "resource sample skipped");
                }
                SampleRead::Exited => {
                    tracing::debug!(backend = sampler.name(), "sampled process exited");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSampler(VecDeque<SampleRead>);

    impl Sampler for ScriptedSampler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn sample(&mut self) -> SampleRead {
            self.0.pop_front().unwrap_or(SampleRead::Exited)
        }
    }

    fn cpu(v: f64) -> SampleRead {
        SampleRead::Sample {
            cpu_percent: v,
            mem_percent: v / 10.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_average() {
        let sampler = ScriptedSampler(VecDeque::from([cpu(10.0), cpu(20.0), cpu(30.0)]));
        let mut monitor = ResourceMonitor::start_with(Box::new(sampler), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snap = monitor.stop().await;
        assert_eq!(snap.samples, 3);
        assert!((snap.avg_cpu_percent - 20.0).abs() < 1e-9);
        assert!((snap.avg_mem_percent - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_samples_do_not_count() {
        let sampler = ScriptedSampler(VecDeque::from([
            SampleRead::Skipped("permission denied".into()),
            cpu(40.0),
            SampleRead::Skipped("permission denied".into()),
            cpu(60.0),
        ]));
        let mut monitor = ResourceMonitor::start_with(Box::new(sampler), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let snap = monitor.stop().await;
        assert_eq!(snap.samples, 2);
        assert!((snap.avg_cpu_percent - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_repeatable() {
        let sampler = ScriptedSampler(VecDeque::from([cpu(5.0)]));
        let mut monitor = ResourceMonitor::start_with(Box::new(sampler), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = monitor.stop().await;
        let second = monitor.stop().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_idle_monitor_reports_nothing() {
        let mut monitor = ResourceMonitor::idle();
        assert_eq!(monitor.backend(), "none");
        assert_eq!(monitor.snapshot(Duration::from_secs(90)).samples, 0);
        assert_eq!(monitor.stop().await, ResourceSnapshot::default());
    }

    #[test]
    fn test_windowed_average_ignores_old_samples() {
        let buffer = SampleBuffer::default();
        let now = Instant::now();
        let old = now.checked_sub(Duration::from_secs(120)).unwrap();
        buffer.push(ResourceSample {
            at: old,
            cpu_percent: 90.0,
            mem_percent: 90.0,
        });
        buffer.push(ResourceSample {
            at: now,
            cpu_percent: 30.0,
            mem_percent: 10.0,
        });

        let recent = buffer.average_since(now.checked_sub(Duration::from_secs(60)));
        assert_eq!(recent.samples, 1);
        assert_eq!(recent.avg_cpu_percent, 30.0);

        let overall = buffer.average_since(None);
        assert_eq!(overall.samples, 2);
        assert_eq!(overall.avg_cpu_percent, 60.0);
    }
}
