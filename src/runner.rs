/// Workload process lifecycle: spawn the benchmark with merged stdout/stderr,
/// stream its output line by line, and kill it on demand.
use crate::channel::ChannelError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Errors that prevent an attempt from starting. None of these are retried.
#[derive(Debug)]
pub enum LaunchError {
    /// The argument vector had no program.
    EmptyCommand,
    /// The executable path does not exist.
    MissingExecutable { path: PathBuf },
    /// The OS refused to fork/exec the program.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Writing the options file or preparing the database failed.
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The live tuning channel could not be created.
    Channel(ChannelError),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::EmptyCommand => write!(f, "empty workload command"),
            LaunchError::MissingExecutable { path } => {
                write!(f, "workload executable {} does not exist", path.display())
            }
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            LaunchError::Prepare { path, source } => {
                write!(f, "failed to prepare {}: {}", path.display(), source)
            }
            LaunchError::Channel(e) => write!(f, "tuning channel unavailable: {e}"),
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::Prepare { source, .. } => Some(source),
            LaunchError::Channel(e) => Some(e),
            LaunchError::EmptyCommand | LaunchError::MissingExecutable { .. } => None,
        }
    }
}

impl From<ChannelError> for LaunchError {
    fn from(e: ChannelError) -> Self {
        LaunchError::Channel(e)
    }
}

/// Starts workload processes. The controller only sees this seam, so tests
/// can substitute scripted output.
pub trait Launcher: Send + Sync {
    /// Start `argv[0]` with the remaining arguments.
    fn launch(&self, argv: &[String]) -> Result<WorkloadProcess, LaunchError>;
}

/// Launches real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl Launcher for ProcessRunner {
    fn launch(&self, argv: &[String]) -> Result<WorkloadProcess, LaunchError> {
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

        if program.contains('/') && !Path::new(program).exists() {
            return Err(LaunchError::MissingExecutable {
                path: PathBuf::from(program),
            });
        }

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let pid = child.id();
        tracing::info!(pid = ?pid, program = %program, "workload process started");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(WorkloadProcess {
            lines: rx,
            captured: String::new(),
            child: Some(child),
            pid,
            reaped: false,
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "workload output stream closed with error");
                break;
            }
        }
    }
}

/// Handle to a running (or finished) workload.
///
/// Output is a forward-only line sequence; every line handed out is also
/// appended to the captured text returned by [`WorkloadProcess::wait`].
pub struct WorkloadProcess {
    lines: mpsc::UnboundedReceiver<String>,
    captured: String,
    child: Option<Child>,
    pid: Option<u32>,
    reaped: bool,
}

impl WorkloadProcess {
    /// A process-less handle that replays fixed output.
    #[cfg(test)]
    pub fn scripted(lines: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            let _ = tx.send(format!("{line}\n"));
        }
        Self::from_receiver(rx)
    }

    /// A process-less handle fed by whoever holds the sender.
    #[cfg(test)]
    pub fn from_receiver(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            lines,
            captured: String::new(),
            child: None,
            pid: None,
            reaped: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next output line without its terminator, or `None` once both streams end.
    pub async fn next_line(&mut self) -> Option<String> {
        let raw = self.lines.recv().await?;
        self.captured.push_str(&raw);
        Some(raw.trim_end_matches(['\n', '\r']).to_string())
    }

    /// Kill the whole process group and reap the child. Safe to call repeatedly.
    pub async fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;
        // Lines already buffered are still delivered, nothing after.
        self.lines.close();
        let Some(child) = self.child.as_mut() else {
            return;
        };

        if let Some(pid) = self.pid {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid, error = %e, "failed to kill workload process group"),
            }
        }
        let _ = child.start_kill();
        match child.wait().await {
            Ok(status) => tracing::info!(pid = ?self.pid, status = %status, "workload terminated"),
            Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "failed to reap workload"),
        }
    }

    /// Drain remaining output, wait for exit, and return everything captured.
    ///
    /// A nonzero exit status is logged but not interpreted; the output parser
    /// classifies failures from the text.
    pub async fn wait(mut self) -> String {
        while self.next_line().await.is_some() {}

        if !self.reaped {
            self.reaped = true;
            if let Some(child) = self.child.as_mut() {
                match child.wait().await {
                    Ok(status) => tracing::info!(
                        pid = ?self.pid,
                        exit_code = ?status.code(),
                        "workload exited"
                    ),
                    Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "failed to wait for workload"),
                }
            }
        }
        std::mem::take(&mut self.captured)
    }
}

impl Drop for WorkloadProcess {
    fn drop(&mut self) {
        if self.reaped || self.child.is_none() {
            return;
        }
        if let Some(pid) = self.pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}
