/// Auxiliary context handed to the advisor on restart and live retune:
/// device characterization and a summary of the workload's operation trace.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::process::Command;

pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = String> + Send + 'a>>;

pub trait Diagnostics: Send + Sync {
    /// Host and storage description for the device holding `db_path`.
    fn device_info(&self, db_path: &Path) -> String;

    /// Summary of the trace file. `last_lines` keeps only the tail, for
    /// questions about recent behavior. Analysis runs an external tool, so
    /// this is async.
    fn trace_summary(&self, trace_file: &Path, last_lines: Option<usize>) -> SummaryFuture<'_>;
}

/// Reads host facts via sysinfo, an fio result file, and an optional trace
/// analyzer executable.
#[derive(Debug, Clone, Default)]
pub struct HostDiagnostics {
    fio_result: Option<PathBuf>,
    trace_analyzer: Option<PathBuf>,
}

impl HostDiagnostics {
    pub fn new(fio_result: Option<PathBuf>, trace_analyzer: Option<PathBuf>) -> Self {
        Self {
            fio_result,
            trace_analyzer,
        }
    }
}

impl Diagnostics for HostDiagnostics {
    fn device_info(&self, db_path: &Path) -> String {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let mut info = format!(
            "Database path: {}\nCPU cores: {}\nTotal memory: {} MiB\nKernel: {}\n",
            db_path.display(),
            sys.cpus().len(),
            sys.total_memory() / (1024 * 1024),
            sysinfo::System::kernel_version().unwrap_or_else(|| "unknown".into()),
        );

        if let Some(path) = &self.fio_result {
            match std::fs::read_to_string(path) {
                Ok(fio) => {
                    info.push_str("fio result:\n");
                    info.push_str(&fio);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "fio result unavailable");
                }
            }
        }
        info
    }

    fn trace_summary(&self, trace_file: &Path, last_lines: Option<usize>) -> SummaryFuture<'_> {
        let trace_file = trace_file.to_path_buf();
        Box::pin(async move {
            let Some(analyzer) = &self.trace_analyzer else {
                return String::new();
            };
            run_analyzer(analyzer, &trace_file, last_lines).await
        })
    }
}

async fn run_analyzer(analyzer: &Path, trace_file: &Path, last_lines: Option<usize>) -> String {
    let output_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "no scratch dir for trace analysis");
            return String::new();
        }
    };

    let output = Command::new(analyzer)
        .arg(format!("-trace_path={}", trace_file.display()))
        .arg(format!("-output_dir={}", output_dir.path().display()))
        .arg("-analyze_get")
        .arg("-analyze_put")
        .arg("-analyze_iterator")
        .arg("-print_overall_stats")
        .kill_on_drop(true)
        .output()
        .await;
    let text = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        Ok(out) => {
            tracing::warn!(status = ?out.status.code(), "trace analyzer failed");
            return String::new();
        }
        Err(e) => {
            tracing::warn!(analyzer = %analyzer.display(), error = %e, "trace analyzer not runnable");
            return String::new();
        }
    };
    match last_lines {
        Some(n) => tail_lines(&text, n),
        None => text,
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_includes_fio_result() {
        let dir = tempfile::tempdir().unwrap();
        let fio = dir.path().join("fio.txt");
        std::fs::write(&fio, "read: IOPS=120k").unwrap();
        let diag = HostDiagnostics::new(Some(fio), None);
        let info = diag.device_info(Path::new("/tmp/db"));
        assert!(info.contains("Database path: /tmp/db"));
        assert!(info.contains("IOPS=120k"));
    }

    #[test]
    fn test_device_info_tolerates_missing_fio() {
        let diag = HostDiagnostics::new(Some(PathBuf::from("/nonexistent/fio.txt")), None);
        assert!(diag.device_info(Path::new("/db")).contains("CPU cores"));
    }

    #[tokio::test]
    async fn test_trace_summary_without_analyzer_is_empty() {
        let diag = HostDiagnostics::default();
        assert_eq!(diag.trace_summary(Path::new("/db/tracefile"), None).await, "");
    }

    #[tokio::test]
    async fn test_trace_summary_tails_analyzer_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("analyzer.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf 'w1\\nw2\\nw3\\nw4\\n'\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let diag = HostDiagnostics::new(None, Some(script));
        assert_eq!(diag.trace_summary(Path::new("/db/tracefile"), Some(2)).await, "w3\nw4");
        assert!(diag.trace_summary(Path::new("/db/tracefile"), None).await.starts_with("w1"));
    }

    #[test]
    fn test_tail_lines_short_input() {
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
    }
}
