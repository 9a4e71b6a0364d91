/// Execution controller: runs one benchmark attempt chain end to end.
///
/// Each attempt writes the options file, prepares the database, launches the
/// workload, and watches its output through a [`DecisionGate`]. A degraded run
/// is killed and relaunched with advisor-supplied options (bounded by the
/// restart budget); a badly degraded run past that point gets options pushed
/// through the live tuning channel instead. Only the terminal attempt's output
/// is returned.
use crate::advisor::{AdvisorQuery, TuningAdvisor, TuningRecord};
use crate::archive::{write_atomic, ArchiveError, RunArchive};
use crate::channel::SharedTuningChannel;
use crate::config::SentinelConfig;
use crate::diagnostics::Diagnostics;
use crate::monitor::{ResourceMonitor, ResourceSnapshot};
use crate::policy::{Decision, DecisionGate, DecisionPolicy, ThroughputSample};
use crate::runner::{LaunchError, Launcher, WorkloadProcess};
use crate::workload::{BenchParams, Preload, Workload};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";

/// What to run for one attempt chain.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub bench_binary: PathBuf,
    pub db_path: PathBuf,
    pub iteration: u32,
    pub workload: Workload,
    pub extra_args: Vec<String>,
    pub options: String,
}

/// Result of the terminal attempt.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: String,
    pub resources: ResourceSnapshot,
    /// Options in effect at the end, including any live overrides.
    pub options: String,
    pub extra_args: Vec<String>,
    pub restarts: u32,
}

/// File locations shared by every attempt of a run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub options_file: PathBuf,
    pub trace_model: PathBuf,
    pub tuning_channel: PathBuf,
}

impl RunPaths {
    /// Configured paths win; otherwise files live in the archive directory.
    pub fn resolve(config: &SentinelConfig, archive: &RunArchive) -> Self {
        Self {
            options_file: config
                .paths
                .options_file
                .clone()
                .unwrap_or_else(|| archive.options_file()),
            trace_model: config
                .workload
                .trace_model
                .clone()
                .unwrap_or_else(|| archive.trace_model()),
            tuning_channel: config.paths.tuning_channel.clone(),
        }
    }
}

enum AttemptEnd {
    Finished(RunOutput),
    Restart(RunRequest),
}

/// Options pushed live during one attempt.
struct LiveTuning {
    current: String,
    history: Vec<TuningRecord>,
    applied: bool,
}

pub struct ExecutionController<'a> {
    config: &'a SentinelConfig,
    paths: &'a RunPaths,
    launcher: &'a dyn Launcher,
    advisor: &'a dyn TuningAdvisor,
    diagnostics: &'a dyn Diagnostics,
}

impl<'a> ExecutionController<'a> {
    pub fn new(
        config: &'a SentinelConfig,
        paths: &'a RunPaths,
        launcher: &'a dyn Launcher,
        advisor: &'a dyn TuningAdvisor,
        diagnostics: &'a dyn Diagnostics,
    ) -> Self {
        Self {
            config,
            paths,
            launcher,
            advisor,
            diagnostics,
        }
    }

    pub fn paths(&self) -> &RunPaths {
        self.paths
    }

    /// Run `request` to completion, restarting degraded attempts.
    ///
    /// Decisions are only made when the side checker is on and a `baseline`
    /// exists. `history` is forwarded to the advisor on restart.
    pub async fn run(
        &self,
        request: RunRequest,
        baseline: Option<f64>,
        history: &[TuningRecord],
    ) -> Result<RunOutput, LaunchError> {
        let mut request = request;
        let mut restarts = 0;
        loop {
            match self.attempt(&request, baseline, restarts, history).await? {
                AttemptEnd::Finished(mut output) => {
                    output.restarts = restarts;
                    return Ok(output);
                }
                AttemptEnd::Restart(next) => {
                    restarts += 1;
                    tracing::info!(
                        iteration = request.iteration,
                        restarts,
                        max_restarts = self.config.policy.max_restarts,
                        "relaunching benchmark"
                    );
                    request = next;
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &RunRequest,
        baseline: Option<f64>,
        restarts: u32,
        history: &[TuningRecord],
    ) -> Result<AttemptEnd, LaunchError> {
        let options_file = &self.paths.options_file;
        write_atomic(options_file, request.options.as_bytes()).map_err(|e| match e {
            ArchiveError::Write { path, source } => LaunchError::Prepare { path, source },
            ArchiveError::Serialize(e) => LaunchError::Prepare {
                path: options_file.clone(),
                source: std::io::Error::other(e),
            },
        })?;

        let params = BenchParams {
            bench_binary: &request.bench_binary,
            db_path: &request.db_path,
            options_file,
            trace_model: &self.paths.trace_model,
            workload: &self.config.workload,
        };

        self.prepare_database(&request.db_path).await?;
        self.preload(request.workload.preload(&params), &request.db_path)
            .await?;

        let policy = &self.config.policy;
        let watched = baseline.filter(|_| policy.side_checker);
        let mut argv = request.workload.command(&params);
        let mut channel = match watched {
            Some(_) if policy.live_tuning => {
                let channel = SharedTuningChannel::create(&self.paths.tuning_channel)?;
                channel.attach(&mut argv);
                Some(channel)
            }
            _ => None,
        };
        argv.extend(request.extra_args.iter().cloned());

        tracing::info!(
            iteration = request.iteration,
            workload = %request.workload,
            restarts,
            watched = watched.is_some(),
            "launching benchmark"
        );
        tracing::debug!(argv = ?argv, "benchmark command");

        let mut process = self.launcher.launch(&argv)?;
        let mut monitor = ResourceMonitor::start(&self.config.monitor, process.pid());
        tracing::debug!(backend = monitor.backend(), pid = ?process.pid(), "resource monitor started");
        let mut gate = watched.map(|b| {
            DecisionGate::new(
                DecisionPolicy::from_config(policy, self.config.workload.num_threads),
                b,
                restarts,
            )
        });
        let mut live = LiveTuning {
            current: request.options.clone(),
            history: Vec::new(),
            applied: false,
        };
        let started = Instant::now();

        while let Some(line) = self.next_line(&mut process).await {
            let (Some(gate), Some(baseline)) = (gate.as_mut(), watched) else {
                continue;
            };
            match gate.observe(started.elapsed(), &line) {
                Decision::Wait => {}
                Decision::Hold(sample) => tracing::debug!(
                    ops_per_sec = sample.ops_per_sec,
                    baseline,
                    "throughput within bounds"
                ),
                Decision::Restart(sample) => {
                    tracing::warn!(
                        ops_per_sec = sample.ops_per_sec,
                        baseline,
                        ratio = policy.restart_ratio,
                        "throughput below restart threshold"
                    );
                    let next = self
                        .restart(request, &mut process, &mut monitor, sample, history)
                        .await;
                    return Ok(AttemptEnd::Restart(next));
                }
                Decision::Reconfigure(sample) => {
                    tracing::warn!(
                        ops_per_sec = sample.ops_per_sec,
                        baseline,
                        ratio = policy.reconfigure_ratio,
                        "throughput below reconfigure threshold"
                    );
                    if let Some(channel) = channel.as_mut() {
                        self.reconfigure(request, channel, &monitor, sample, &mut live)
                            .await;
                    }
                }
            }
        }

        let resources = monitor.stop().await;
        let output = process.wait().await;
        let options = if live.applied {
            merge_overrides(&request.options, &live.current)
        } else {
            request.options.clone()
        };
        tracing::info!(
            iteration = request.iteration,
            avg_cpu = resources.avg_cpu_percent,
            avg_mem = resources.avg_mem_percent,
            evaluations = gate.as_ref().map_or(0, DecisionGate::evaluations),
            live_updates = live.history.len(),
            "benchmark finished"
        );
        Ok(AttemptEnd::Finished(RunOutput {
            output,
            resources,
            options,
            extra_args: request.extra_args.clone(),
            restarts: 0,
        }))
    }

    /// Next output line, or `None` at end of output or after an idle timeout.
    async fn next_line(&self, process: &mut WorkloadProcess) -> Option<String> {
        let Some(limit) = self.config.policy.idle_timeout() else {
            return process.next_line().await;
        };
        match tokio::time::timeout(limit, process.next_line()).await {
            Ok(line) => line,
            Err(_) => {
                tracing::warn!(
                    idle_secs = limit.as_secs(),
                    "no workload output within idle timeout, terminating"
                );
                process.terminate().await;
                None
            }
        }
    }

    /// Tear down the current attempt and ask for replacement options. An
    /// advisor failure relaunches with the request unchanged.
    async fn restart(
        &self,
        request: &RunRequest,
        process: &mut WorkloadProcess,
        monitor: &mut ResourceMonitor,
        sample: ThroughputSample,
        history: &[TuningRecord],
    ) -> RunRequest {
        let resources = monitor.stop().await;
        process.terminate().await;

        let device_info = self.diagnostics.device_info(&request.db_path);
        let trace_summary = self
            .diagnostics
            .trace_summary(&request.db_path.join("tracefile"), None)
            .await;
        let query = AdvisorQuery::Restart {
            options: &request.options,
            extra_args: &request.extra_args,
            avg_cpu: resources.avg_cpu_percent,
            avg_mem: resources.avg_mem_percent,
            ops_per_sec: sample.ops_per_sec,
            device_info: &device_info,
            trace_summary: &trace_summary,
            history,
        };

        let mut next = request.clone();
        match self.advisor.advise(&query).await {
            Ok(proposal) => {
                next.options = proposal.options;
                next.extra_args = proposal.extra_args;
            }
            Err(e) => {
                tracing::warn!(error = %e, "advisor failed on restart, relaunching with unchanged options");
            }
        }
        next
    }

    /// Ask for options to apply in place and publish them on the channel.
    async fn reconfigure(
        &self,
        request: &RunRequest,
        channel: &mut SharedTuningChannel,
        monitor: &ResourceMonitor,
        sample: ThroughputSample,
        live: &mut LiveTuning,
    ) {
        let window = self.config.policy.check_interval();
        let resources = monitor.snapshot(window);
        let device_info = self.diagnostics.device_info(&request.db_path);
        let trace_summary = self.diagnostics.trace_summary(
            &request.db_path.join("tracefile"),
            Some(trace_window_lines(window)),
        )
        .await;

        live.history.push(TuningRecord {
            options: live.current.clone(),
            ops_per_sec: sample.ops_per_sec,
        });
        let query = AdvisorQuery::Live {
            extra_args: &request.extra_args,
            avg_cpu: resources.avg_cpu_percent,
            avg_mem: resources.avg_mem_percent,
            device_info: &device_info,
            trace_summary: &trace_summary,
            history: &live.history,
        };

        let proposal = match self.advisor.advise(&query).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "advisor failed on live retune, keeping current options");
                return;
            }
        };
        match channel.write(&proposal.options) {
            Ok(sequence) => {
                tracing::info!(
                    channel = %channel.path().display(),
                    sequence,
                    ops_per_sec = sample.ops_per_sec,
                    "live options applied"
                );
                live.current = proposal.options;
                live.applied = true;
            }
            Err(e) => tracing::warn!(error = %e, "failed to publish live options"),
        }
    }

    async fn prepare_database(&self, db_path: &Path) -> Result<(), LaunchError> {
        let prepare = &self.config.prepare;
        if prepare.wipe_db {
            match tokio::fs::remove_dir_all(db_path).await {
                Ok(()) => tracing::debug!(path = %db_path.display(), "removed database"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LaunchError::Prepare {
                        path: db_path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        if prepare.drop_caches {
            drop_page_cache().await;
        }
        if prepare.settle_secs > 0 {
            tracing::debug!(secs = prepare.settle_secs, "letting the system settle");
            tokio::time::sleep(Duration::from_secs(prepare.settle_secs)).await;
        }
        Ok(())
    }

    async fn preload(&self, preload: Preload, db_path: &Path) -> Result<(), LaunchError> {
        match preload {
            Preload::None => Ok(()),
            Preload::CopySnapshot(source) => {
                tracing::info!(from = %source.display(), to = %db_path.display(), "copying database snapshot");
                let target = db_path.to_path_buf();
                let copied = tokio::task::spawn_blocking(move || {
                    match std::fs::remove_dir_all(&target) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                    copy_dir(&source, &target)
                })
                .await
                .map_err(std::io::Error::other)
                .and_then(|r| r);
                copied.map_err(|e| LaunchError::Prepare {
                    path: db_path.to_path_buf(),
                    source: e,
                })
            }
            Preload::Load(argv) | Preload::Command(argv) => {
                tracing::info!(program = ?argv.first(), "preloading database");
                let output = self.launcher.launch(&argv)?.wait().await;
                tracing::debug!(bytes = output.len(), "preload finished");
                Ok(())
            }
        }
    }
}

/// Trace lines covering one check interval, at roughly one line per 10s.
fn trace_window_lines(window: Duration) -> usize {
    (window.as_secs() / 10).max(1) as usize
}

/// Flush dirty pages and drop the page cache. Needs root; failures are logged.
async fn drop_page_cache() {
    match tokio::process::Command::new("sync").status().await {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(status = %status, "sync failed"),
        Err(e) => tracing::warn!(error = %e, "sync not runnable"),
    }
    if let Err(e) = tokio::fs::write(DROP_CACHES, "3").await {
        tracing::warn!(error = %e, "could not drop page cache");
    }
}

/// Copy a database directory tree. Symlinks are recreated as links, not
/// followed, so a snapshot that links to its own subdirectories copies as-is.
fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Apply `key=value` lines from a live blob onto an options file.
///
/// A section header in the blob (`[CFOptions "hot"]`) scopes the keys after
/// it: they are rewritten inside that section only, appended to its end when
/// missing there, and a missing section is appended whole. Keys before any
/// header rewrite their first match anywhere, or are appended at the end.
/// Rewrites keep the line's indentation. Comments are ignored.
pub fn merge_overrides(options: &str, overrides: &str) -> String {
    let mut lines: Vec<String> = options.lines().map(str::to_string).collect();
    let mut section: Option<&str> = None;
    for line in overrides.lines() {
        if let Some(header) = section_header(line) {
            section = Some(header);
        } else if let Some((key, value)) = option_pair(line) {
            apply_override(&mut lines, section, key, value);
        }
    }
    let mut merged = lines.join("\n");
    merged.push('\n');
    merged
}

fn apply_override(lines: &mut Vec<String>, section: Option<&str>, key: &str, value: &str) {
    let span = match section {
        None => 0..lines.len(),
        Some(header) => match section_span(lines, header) {
            Some(span) => span,
            None => {
                lines.push(header.to_string());
                lines.push(format!("  {key}={value}"));
                return;
            }
        },
    };

    let existing = lines[span.clone()]
        .iter()
        .position(|line| option_pair(line).is_some_and(|(k, _)| k == key));
    match existing {
        Some(i) => {
            let line = &mut lines[span.start + i];
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            *line = format!("{indent}{key}={value}");
        }
        None => {
            // After the section's last non-blank line, before any spacing.
            let end = lines[span.clone()]
                .iter()
                .rposition(|line| !line.trim().is_empty())
                .map_or(span.start, |i| span.start + i + 1);
            lines.insert(end, format!("  {key}={value}"));
        }
    }
}

/// Body lines of the section opened by `header`, excluding the header itself.
fn section_span(lines: &[String], header: &str) -> Option<std::ops::Range<usize>> {
    let start = lines
        .iter()
        .position(|line| section_header(line) == Some(header))?
        + 1;
    let end = lines[start..]
        .iter()
        .position(|line| section_header(line).is_some())
        .map_or(lines.len(), |i| start + i);
    Some(start..end)
}

pub(crate) fn section_header(line: &str) -> Option<&str> {
    let line = line.trim();
    (line.starts_with('[') && line.ends_with(']')).then_some(line)
}

pub(crate) fn option_pair(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}
