/// The tuning advisor: whatever produces new option files.
///
/// The controller and retry coordinator never generate tuning content
/// themselves. They send an [`AdvisorQuery`] and get back a [`Proposal`].
/// [`CommandAdvisor`] speaks JSON over stdin/stdout to an external program.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// One configuration and the throughput it achieved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    pub options: String,
    pub ops_per_sec: f64,
}

/// Advisor answer. Live queries only use `options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub options: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub changed_values: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvisorQuery<'a> {
    /// Next configuration for a fresh iteration.
    Propose {
        options: &'a str,
        extra_args: &'a [String],
        history: &'a [TuningRecord],
    },
    /// The engine rejected `options` or the run produced no metrics.
    CorrectError {
        options: &'a str,
        extra_args: &'a [String],
        reasoning: &'a str,
        changed_values: &'a Value,
        error: &'a str,
        attempt: u32,
    },
    /// A run fell below baseline and was killed; propose its replacement.
    Restart {
        options: &'a str,
        extra_args: &'a [String],
        avg_cpu: f64,
        avg_mem: f64,
        ops_per_sec: f64,
        device_info: &'a str,
        trace_summary: &'a str,
        history: &'a [TuningRecord],
    },
    /// A run is badly degraded; propose options to apply without restarting.
    Live {
        extra_args: &'a [String],
        avg_cpu: f64,
        avg_mem: f64,
        device_info: &'a str,
        trace_summary: &'a str,
        history: &'a [TuningRecord],
    },
}

impl AdvisorQuery<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            AdvisorQuery::Propose { .. } => "propose",
            AdvisorQuery::CorrectError { .. } => "correct_error",
            AdvisorQuery::Restart { .. } => "restart",
            AdvisorQuery::Live { .. } => "live",
        }
    }
}

#[derive(Debug)]
pub enum AdvisorError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Io(std::io::Error),
    Failed { status: Option<i32>, stderr: String },
    Encode(serde_json::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for AdvisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvisorError::Spawn { command, source } => {
                write!(f, "failed to spawn advisor {}: {}", command, source)
            }
            AdvisorError::Io(e) => write!(f, "advisor I/O error: {e}"),
            AdvisorError::Failed { status, stderr } => {
                write!(f, "advisor exited with {:?}: {}", status, stderr.trim())
            }
            AdvisorError::Encode(e) => write!(f, "failed to encode advisor query: {e}"),
            AdvisorError::Decode(e) => write!(f, "advisor returned invalid proposal: {e}"),
        }
    }
}

impl std::error::Error for AdvisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdvisorError::Spawn { source, .. } => Some(source),
            AdvisorError::Io(e) => Some(e),
            AdvisorError::Encode(e) | AdvisorError::Decode(e) => Some(e),
            AdvisorError::Failed { .. } => None,
        }
    }
}

pub type AdvisorFuture<'a> = Pin<Box<dyn Future<Output = Result<Proposal, AdvisorError>> + Send + 'a>>;

/// Advisors may take minutes (a model call, a search), so answers are async.
/// The query is consumed before the returned future first polls.
pub trait TuningAdvisor: Send + Sync {
    fn advise(&self, query: &AdvisorQuery<'_>) -> AdvisorFuture<'_>;
}

/// Runs an external program per query: JSON query on stdin, JSON proposal on stdout.
#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    command: String,
    args: Vec<String>,
}

impl CommandAdvisor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl TuningAdvisor for CommandAdvisor {
    fn advise(&self, query: &AdvisorQuery<'_>) -> AdvisorFuture<'_> {
        let payload = serde_json::to_vec(query).map_err(AdvisorError::Encode);
        let kind = query.kind();
        Box::pin(async move {
            let payload = payload?;
            tracing::info!(command = %self.command, kind, "consulting advisor");

            let mut child = Command::new(&self.command)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| AdvisorError::Spawn {
                    command: self.command.clone(),
                    source: e,
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                // A closed pipe just means the advisor ignored its input.
                if let Err(e) = stdin.write_all(&payload).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(AdvisorError::Io(e));
                    }
                }
            }

            let output = child.wait_with_output().await.map_err(AdvisorError::Io)?;
            if !output.status.success() {
                return Err(AdvisorError::Failed {
                    status: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            serde_json::from_slice(&output.stdout).map_err(AdvisorError::Decode)
        })
    }
}
