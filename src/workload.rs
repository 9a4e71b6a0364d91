/// Benchmark workloads and the argument vectors that drive them.
///
/// Every supported workload is a `Workload` variant; argument construction and
/// database preload policy are exhaustive matches over it.
use crate::config::WorkloadConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    FillRandom,
    ReadRandomWriteRandom,
    ReadRandom,
    MixGraph,
    ReadWhileWriting,
    SineTest,
    JsonConfigured,
    TraceFile,
}

/// Returned when a workload name is not in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWorkload(pub String);

impl std::fmt::Display for UnknownWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let known: Vec<&str> = Workload::ALL.iter().map(|w| w.name()).collect();
        write!(
            f,
            "workload '{}' not recognized (expected one of: {})",
            self.0,
            known.join(", ")
        )
    }
}

impl std::error::Error for UnknownWorkload {}

impl FromStr for Workload {
    type Err = UnknownWorkload;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Workload::ALL
            .into_iter()
            .find(|w| w.name() == s)
            .ok_or_else(|| UnknownWorkload(s.to_string()))
    }
}

/// How the database is brought into shape before the measured run.
#[derive(Debug, Clone, PartialEq)]
pub enum Preload {
    /// Start from whatever the wipe left behind.
    None,
    /// Copy a pre-built database directory into place.
    CopySnapshot(PathBuf),
    /// Run a synchronous benchmark invocation that fills the database.
    Load(Vec<String>),
    /// Run an arbitrary user command that builds the database.
    Command(Vec<String>),
}

/// Inputs needed to build a benchmark argument vector.
#[derive(Debug, Clone)]
pub struct BenchParams<'a> {
    pub bench_binary: &'a Path,
    pub db_path: &'a Path,
    pub options_file: &'a Path,
    pub trace_model: &'a Path,
    pub workload: &'a WorkloadConfig,
}

impl Workload {
    pub const ALL: [Workload; 8] = [
        Workload::FillRandom,
        Workload::ReadRandomWriteRandom,
        Workload::ReadRandom,
        Workload::MixGraph,
        Workload::ReadWhileWriting,
        Workload::SineTest,
        Workload::JsonConfigured,
        Workload::TraceFile,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Workload::FillRandom => "fillrandom",
            Workload::ReadRandomWriteRandom => "readrandomwriterandom",
            Workload::ReadRandom => "readrandom",
            Workload::MixGraph => "mixgraph",
            Workload::ReadWhileWriting => "readwhilewriting",
            Workload::SineTest => "sinetest",
            Workload::JsonConfigured => "jsonconfigured",
            Workload::TraceFile => "tracefile",
        }
    }

    /// Full argument vector (program first) for the measured run.
    ///
    /// Tuning-channel and caller-supplied extra arguments are appended later
    /// by the controller.
    pub fn command(&self, params: &BenchParams<'_>) -> Vec<String> {
        let w = params.workload;
        let mut argv = common_args(params);
        argv.extend(run_window_args(params));

        match self {
            Workload::FillRandom => argv.push("--benchmarks=fillrandom".into()),
            Workload::ReadRandomWriteRandom => {
                argv.push("--benchmarks=readrandomwriterandom".into())
            }
            Workload::ReadRandom => argv.extend([
                "--benchmarks=readrandom".to_string(),
                "--use_existing_db".to_string(),
                "--reads=5000000".to_string(),
            ]),
            Workload::MixGraph => {
                argv.extend([
                    "--benchmarks=mixgraph".to_string(),
                    "--use_existing_db".to_string(),
                    "--mix_get_ratio=0.83".to_string(),
                    "--mix_put_ratio=0.14".to_string(),
                    "--mix_seek_ratio=0.03".to_string(),
                    "--key_size=48".to_string(),
                    format!(
                        "--sine_write_rate_interval_milliseconds={}",
                        w.sine_write_rate_interval_ms
                    ),
                    "--sine_mix_rate".to_string(),
                ]);
                argv.extend(sine_args(w));
            }
            Workload::ReadWhileWriting => argv.push("--benchmarks=readwhilewriting".into()),
            Workload::SineTest => {
                argv.extend([
                    "--benchmarks=fillrandom".to_string(),
                    "--sine_write_rate=true".to_string(),
                    format!(
                        "--sine_write_rate_interval_milliseconds={}",
                        w.sine_write_rate_interval_ms
                    ),
                ]);
                argv.extend(sine_args(w));
            }
            Workload::JsonConfigured => argv.extend([
                "--benchmarks=jsonconfigured".to_string(),
                format!("--json_file_path={}", w.json_file.display()),
            ]),
            Workload::TraceFile => argv.extend([
                "--benchmarks=jsonconfigured".to_string(),
                "--use_existing_db".to_string(),
                format!("--json_file_path={}", params.trace_model.display()),
            ]),
        }
        argv
    }

    /// Preload policy for this workload.
    ///
    /// Read-heavy workloads need a populated database: a configured snapshot
    /// wins, otherwise they fill one themselves.
    pub fn preload(&self, params: &BenchParams<'_>) -> Preload {
        let w = params.workload;
        let snapshot = w.preload_db_path.clone();
        let load_base = || {
            let mut argv = common_args(params);
            argv.push(format!("--num={}", w.preload_num));
            argv.push("--benchmarks=fillrandom".to_string());
            argv
        };

        match self {
            Workload::ReadRandom => match snapshot {
                Some(path) => Preload::CopySnapshot(path),
                None => {
                    let mut argv = load_base();
                    argv.push("--max_background_jobs=8".to_string());
                    Preload::Load(argv)
                }
            },
            Workload::MixGraph => match snapshot {
                Some(path) => Preload::CopySnapshot(path),
                None => {
                    let mut argv = load_base();
                    argv.push("--key_size=48".to_string());
                    argv.push("--value_size=43".to_string());
                    Preload::Load(argv)
                }
            },
            Workload::TraceFile => match (snapshot, w.preload_cmd.as_deref()) {
                (Some(path), _) => Preload::CopySnapshot(path),
                (None, Some(cmd)) if !cmd.trim().is_empty() => {
                    Preload::Command(cmd.split_whitespace().map(str::to_string).collect())
                }
                (None, _) => Preload::None,
            },
            Workload::FillRandom
            | Workload::ReadRandomWriteRandom
            | Workload::ReadWhileWriting
            | Workload::SineTest
            | Workload::JsonConfigured => Preload::None,
        }
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn common_args(params: &BenchParams<'_>) -> Vec<String> {
    vec![
        params.bench_binary.display().to_string(),
        format!("--db={}", params.db_path.display()),
        format!("--options_file={}", params.options_file.display()),
        "--use_direct_io_for_flush_and_compaction".to_string(),
        "--use_direct_reads".to_string(),
        "--compression_type=none".to_string(),
        "--stats_interval_seconds=1".to_string(),
        "--histogram".to_string(),
        format!("--threads={}", params.workload.num_threads),
    ]
}

fn run_window_args(params: &BenchParams<'_>) -> Vec<String> {
    vec![
        format!("--trace_file={}", params.db_path.join("tracefile").display()),
        format!("--num={}", params.workload.num_entries),
        format!("--duration={}", params.workload.duration_secs),
    ]
}

fn sine_args(w: &WorkloadConfig) -> Vec<String> {
    vec![
        format!("--sine_a={}", w.sine_a),
        format!("--sine_b={}", w.sine_b),
        format!("--sine_c={}", w.sine_c),
        format!("--sine_d={}", w.sine_d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(w: &WorkloadConfig) -> BenchParams<'_> {
        BenchParams {
            bench_binary: Path::new("/opt/db_bench"),
            db_path: Path::new("/tmp/db"),
            options_file: Path::new("/tmp/run/options_file.ini"),
            trace_model: Path::new("/tmp/run/trace_model.json"),
            workload: w,
        }
    }

    #[test]
    fn test_parse_every_known_name() {
        for w in Workload::ALL {
            assert_eq!(w.name().parse::<Workload>().unwrap(), w);
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "scanrandom".parse::<Workload>().unwrap_err();
        assert_eq!(err, UnknownWorkload("scanrandom".into()));
        assert!(err.to_string().contains("fillrandom"));
    }

    #[test]
    fn test_fillrandom_command() {
        let w = WorkloadConfig {
            num_threads: 4,
            num_entries: 1000,
            duration_secs: 60,
            ..Default::default()
        };
        let argv = Workload::FillRandom.command(&params(&w));
        assert_eq!(argv[0], "/opt/db_bench");
        assert!(argv.contains(&"--db=/tmp/db".to_string()));
        assert!(argv.contains(&"--options_file=/tmp/run/options_file.ini".to_string()));
        assert!(argv.contains(&"--threads=4".to_string()));
        assert!(argv.contains(&"--trace_file=/tmp/db/tracefile".to_string()));
        assert!(argv.contains(&"--num=1000".to_string()));
        assert!(argv.contains(&"--duration=60".to_string()));
        assert_eq!(argv.last().unwrap(), "--benchmarks=fillrandom");
    }

    #[test]
    fn test_mixgraph_command_carries_ratios_and_sine() {
        let w = WorkloadConfig::default();
        let argv = Workload::MixGraph.command(&params(&w));
        for flag in [
            "--benchmarks=mixgraph",
            "--use_existing_db",
            "--mix_get_ratio=0.83",
            "--mix_put_ratio=0.14",
            "--mix_seek_ratio=0.03",
            "--sine_mix_rate",
            "--sine_a=2000000",
            "--sine_d=10000000",
        ] {
            assert!(argv.contains(&flag.to_string()), "missing {flag}");
        }
    }

    #[test]
    fn test_tracefile_uses_trace_model() {
        let w = WorkloadConfig::default();
        let argv = Workload::TraceFile.command(&params(&w));
        assert!(argv.contains(&"--json_file_path=/tmp/run/trace_model.json".to_string()));
        assert!(argv.contains(&"--benchmarks=jsonconfigured".to_string()));
    }

    #[test]
    fn test_readrandom_preload_prefers_snapshot() {
        let w = WorkloadConfig {
            preload_db_path: Some(PathBuf::from("/data/prebuilt")),
            ..Default::default()
        };
        assert_eq!(
            Workload::ReadRandom.preload(&params(&w)),
            Preload::CopySnapshot(PathBuf::from("/data/prebuilt"))
        );
    }

    #[test]
    fn test_readrandom_preload_loads_without_snapshot() {
        let w = WorkloadConfig {
            preload_num: 500,
            ..Default::default()
        };
        let Preload::Load(argv) = Workload::ReadRandom.preload(&params(&w)) else {
            panic!("expected a load invocation");
        };
        assert!(argv.contains(&"--num=500".to_string()));
        assert!(argv.contains(&"--benchmarks=fillrandom".to_string()));
        assert!(argv.contains(&"--max_background_jobs=8".to_string()));
        assert!(!argv.iter().any(|a| a.starts_with("--duration")));
    }

    #[test]
    fn test_mixgraph_preload_sets_key_and_value_size() {
        let w = WorkloadConfig::default();
        let Preload::Load(argv) = Workload::MixGraph.preload(&params(&w)) else {
            panic!("expected a load invocation");
        };
        assert!(argv.contains(&"--key_size=48".to_string()));
        assert!(argv.contains(&"--value_size=43".to_string()));
    }

    #[test]
    fn test_tracefile_preload_runs_command() {
        let w = WorkloadConfig {
            preload_cmd: Some("./replay.sh --fast".into()),
            ..Default::default()
        };
        assert_eq!(
            Workload::TraceFile.preload(&params(&w)),
            Preload::Command(vec!["./replay.sh".into(), "--fast".into()])
        );
    }

    #[test]
    fn test_write_workloads_skip_preload() {
        let w = WorkloadConfig {
            preload_db_path: Some(PathBuf::from("/data/prebuilt")),
            ..Default::default()
        };
        assert_eq!(Workload::FillRandom.preload(&params(&w)), Preload::None);
        assert_eq!(Workload::SineTest.preload(&params(&w)), Preload::None);
    }
}
