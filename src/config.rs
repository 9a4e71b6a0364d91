use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from sentinel.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SentinelConfig {
    pub paths: PathsConfig,
    pub workload: WorkloadConfig,
    pub prepare: PrepareConfig,
    pub monitor: MonitorConfig,
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub advisor: AdvisorConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// The benchmark executable (db_bench).
    pub bench_binary: PathBuf,
    pub db_path: PathBuf,
    /// Root under which `output/<device>/<timestamp>/` run directories are created.
    pub output_root: PathBuf,
    /// Device label used in the run directory name.
    pub device: String,
    /// Options file the benchmark reads. Defaults to `<run dir>/options_file.ini`.
    pub options_file: Option<PathBuf>,
    /// Options file the first run starts from.
    pub initial_options: PathBuf,
    /// Path of the live tuning channel handed to the workload.
    pub tuning_channel: PathBuf,
    pub fio_result: Option<PathBuf>,
    pub trace_analyzer: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub name: String,
    pub num_entries: u64,
    pub num_threads: u32,
    pub duration_secs: u64,
    pub sine_write_rate_interval_ms: u64,
    pub sine_a: f64,
    pub sine_b: f64,
    pub sine_c: f64,
    pub sine_d: f64,
    /// Benchmark description for `jsonconfigured`.
    pub json_file: PathBuf,
    /// Trace model for `tracefile`. Defaults to `<run dir>/trace_model.json`.
    pub trace_model: Option<PathBuf>,
    /// Pre-built database copied into place for read-heavy workloads.
    pub preload_db_path: Option<PathBuf>,
    /// Command run to build the database for `tracefile` when no pre-built copy exists.
    pub preload_cmd: Option<String>,
    /// Entries written by the synchronous fillrandom load.
    pub preload_num: u64,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    pub wipe_db: bool,
    pub drop_caches: bool,
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub cgroup_root: PathBuf,
    pub cgroup_name: String,
    pub cpu_limit_cores: Option<f64>,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Watch runs that have a baseline and intervene mid-flight.
    pub side_checker: bool,
    /// Push retuned options into the running workload.
    pub live_tuning: bool,
    pub warmup_secs: u64,
    pub check_interval_secs: u64,
    pub restart_ratio: f64,
    pub reconfigure_ratio: f64,
    pub max_restarts: u32,
    /// Kill the workload when it prints nothing for this long. Unset waits forever.
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_corrections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub iterations: u32,
    /// Local-search rounds around the advisor's changed values after each
    /// successful tuning iteration. 0 disables fine-tuning.
    pub finetune_iterations: u32,
    /// Initial scale factor a fine-tune round tries up and down.
    pub finetune_step: f64,
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl SentinelConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reject settings the controller cannot act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        if !(0.0..=1.0).contains(&p.restart_ratio) || !(0.0..=1.0).contains(&p.reconfigure_ratio) {
            return Err(ConfigError::Invalid(format!(
                "policy ratios must be within 0..=1 (restart {}, reconfigure {})",
                p.restart_ratio, p.reconfigure_ratio
            )));
        }
        if self.workload.num_threads == 0 {
            return Err(ConfigError::Invalid("workload.num_threads must be > 0".into()));
        }
        if self.run.finetune_step <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "run.finetune_step must be > 1 (got {})",
                self.run.finetune_step
            )));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("monitor.sample_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

impl PolicyConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

// --- Default implementations ---

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bench_binary: PathBuf::from("db_bench"),
            db_path: PathBuf::from("/tmp/rocksdb_perf"),
            output_root: PathBuf::from("."),
            device: "data".to_string(),
            options_file: None,
            initial_options: PathBuf::from("options_files/default_options.ini"),
            tuning_channel: PathBuf::from("/tmp/mmap_file.mmap"),
            fio_result: None,
            trace_analyzer: None,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: "mixgraph".to_string(),
            num_entries: 2_500_000,
            num_threads: 8,
            duration_secs: 200,
            sine_write_rate_interval_ms: 1000,
            sine_a: 2_000_000.0,
            sine_b: 2.387_324_146_4,
            sine_c: 0.0,
            sine_d: 10_000_000.0,
            json_file: PathBuf::from("benchy.json"),
            trace_model: None,
            preload_db_path: None,
            preload_cmd: None,
            preload_num: 50_000_000,
            extra_args: Vec::new(),
        }
    }
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            wipe_db: true,
            drop_caches: true,
            settle_secs: 30,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 500,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_name: "bench_sentinel".to_string(),
            cpu_limit_cores: None,
            memory_limit_bytes: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            side_checker: true,
            live_tuning: true,
            warmup_secs: 100,
            check_interval_secs: 90,
            restart_ratio: 0.9,
            reconfigure_ratio: 0.6,
            max_restarts: 3,
            idle_timeout_secs: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_corrections: 2 }
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            command: "sentinel-advisor".to_string(),
            args: Vec::new(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            finetune_iterations: 2,
            finetune_step: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuned_constants() {
        let config = SentinelConfig::default();
        assert_eq!(config.policy.restart_ratio, 0.9);
        assert_eq!(config.policy.reconfigure_ratio, 0.6);
        assert_eq!(config.policy.check_interval(), Duration::from_secs(90));
        assert_eq!(config.policy.max_restarts, 3);
        assert_eq!(config.retry.max_corrections, 2);
        assert!(config.policy.idle_timeout().is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SentinelConfig::from_toml(
            r#"
[workload]
name = "fillrandom"
num_threads = 4

[policy]
check_interval_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.workload.name, "fillrandom");
        assert_eq!(config.workload.num_threads, 4);
        assert_eq!(config.workload.duration_secs, 200);
        assert_eq!(config.policy.check_interval_secs, 10);
        assert_eq!(config.policy.warmup_secs, 100);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SentinelConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.run.iterations, 3);
        assert_eq!(config.run.finetune_iterations, 2);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[policy\nwarmup_secs = ").unwrap();
        let err = SentinelConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_ratio_above_one() {
        let mut config = SentinelConfig::default();
        config.policy.restart_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_flat_finetune_step() {
        let mut config = SentinelConfig::default();
        config.run.finetune_step = 1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("finetune_step"));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let mut config = SentinelConfig::default();
        config.workload.num_threads = 0;
        assert!(config.validate().is_err());
    }
}
