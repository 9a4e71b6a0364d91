mod advisor;
mod archive;
mod channel;
mod config;
mod controller;
mod diagnostics;
mod finetune;
mod monitor;
mod parser;
mod policy;
mod retry;
mod runner;
mod workload;

use advisor::{AdvisorQuery, CommandAdvisor, TuningAdvisor, TuningRecord};
use archive::RunArchive;
use clap::Parser;
use config::SentinelConfig;
use controller::{ExecutionController, RunPaths, RunRequest};
use diagnostics::HostDiagnostics;
use finetune::FineTuner;
use parser::DbBenchParser;
use retry::{BenchmarkOutcome, RetryCoordinator, RetryState, TuningHistory};
use runner::ProcessRunner;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use workload::Workload;

/// Runs storage-engine benchmarks under supervision: watches live
/// throughput, restarts or retunes degraded runs, corrects rejected
/// configurations, and archives every attempt.
#[derive(Parser, Debug)]
#[command(name = "bench-sentinel", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "sentinel.toml")]
    config: PathBuf,

    /// Workload name (overrides config)
    #[arg(short, long)]
    workload: Option<String>,

    /// Tuning iterations after the baseline run (overrides config)
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Fine-tune rounds after each successful iteration, 0 to disable (overrides config)
    #[arg(short = 'f', long)]
    finetune_iterations: Option<u32>,

    /// Root directory for run archives (overrides config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (decision evaluations, argument vectors)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "bench_sentinel=debug"
    } else if cli.quiet {
        "bench_sentinel=warn"
    } else {
        "bench_sentinel=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "bench-sentinel aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = SentinelConfig::load(&cli.config)?;
    if let Some(name) = cli.workload {
        config.workload.name = name;
    }
    if let Some(n) = cli.iterations {
        config.run.iterations = n;
    }
    if let Some(n) = cli.finetune_iterations {
        config.run.finetune_iterations = n;
    }
    if let Some(dir) = cli.output {
        config.paths.output_root = dir;
    }
    config.validate()?;

    let workload: Workload = match config.workload.name.parse() {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "unknown workload");
            return Ok(ExitCode::from(1));
        }
    };

    if cli.dry_run {
        println!("bench-sentinel v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Workload: {workload}");
        println!("{config:#?}");
        println!("Dry run mode: config validated, not running.");
        return Ok(ExitCode::SUCCESS);
    }

    let initial = std::fs::read_to_string(&config.paths.initial_options).map_err(|e| {
        format!(
            "failed to read initial options {}: {e}",
            config.paths.initial_options.display()
        )
    })?;

    let archive = RunArchive::create(
        &config.paths.output_root,
        &config.paths.device,
        chrono::Local::now(),
    )?;
    let paths = RunPaths::resolve(&config, &archive);
    let launcher = ProcessRunner;
    let advisor = CommandAdvisor::new(config.advisor.command.clone(), config.advisor.args.clone());
    let diagnostics = HostDiagnostics::new(
        config.paths.fio_result.clone(),
        config.paths.trace_analyzer.clone(),
    );
    let parser = DbBenchParser::new(config.workload.num_threads);
    let controller =
        ExecutionController::new(&config, &paths, &launcher, &advisor, &diagnostics);
    let coordinator = RetryCoordinator::new(
        &controller,
        &advisor,
        &parser,
        &archive,
        config.retry.max_corrections,
    );
    let finetuner = FineTuner::new(
        &coordinator,
        config.run.finetune_iterations,
        config.run.finetune_step,
    );

    let mut history = TuningHistory::new(initial.clone());
    let base = RunRequest {
        bench_binary: config.paths.bench_binary.clone(),
        db_path: config.paths.db_path.clone(),
        iteration: 0,
        workload,
        extra_args: config.workload.extra_args.clone(),
        options: initial,
    };

    tracing::info!(workload = %workload, iterations = config.run.iterations, "starting baseline run");
    let outcome = coordinator
        .run(base.clone(), RetryState::new("initial configuration"), &history)
        .await?;
    let mut extra_args = base.extra_args.clone();
    record(&mut history, &mut extra_args, &outcome);

    for iteration in 1..=config.run.iterations {
        let query = AdvisorQuery::Propose {
            options: history.known_good(),
            extra_args: &extra_args,
            history: history.records(),
        };
        let proposal = match advisor.advise(&query).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(iteration, error = %e, "advisor failed to propose, skipping iteration");
                continue;
            }
        };

        let request = RunRequest {
            iteration,
            options: proposal.options,
            extra_args: if proposal.extra_args.is_empty() {
                extra_args.clone()
            } else {
                proposal.extra_args
            },
            ..base.clone()
        };
        let state = RetryState {
            attempt: 0,
            reasoning: proposal.reasoning,
            changed_values: proposal.changed_values,
        };
        let mut outcome = coordinator
            .run(request.clone(), state.clone(), &history)
            .await?;
        if outcome.succeeded() && config.run.finetune_iterations > 0 {
            outcome = finetuner.run(&request, &state, outcome, &history).await?;
        }
        record(&mut history, &mut extra_args, &outcome);
    }

    let best = history
        .records()
        .iter()
        .map(|r| r.ops_per_sec)
        .fold(None, |best: Option<f64>, x| Some(best.map_or(x, |b| b.max(x))));
    tracing::info!(
        archive = %archive.dir().display(),
        successful_runs = history.records().len(),
        best_ops_per_sec = ?best,
        "tuning finished"
    );

    if history.records().is_empty() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Successful runs join the history and become the next baseline.
fn record(history: &mut TuningHistory, extra_args: &mut Vec<String>, outcome: &BenchmarkOutcome) {
    let Some(ops_per_sec) = outcome.results.ops_per_sec.filter(|_| outcome.succeeded()) else {
        tracing::warn!(error = ?outcome.error, attempts = outcome.attempts, "run failed, keeping previous configuration");
        return;
    };
    history.push(TuningRecord {
        options: outcome.options.clone(),
        ops_per_sec,
    });
    *extra_args = outcome.extra_args.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "bench-sentinel",
            "--config",
            "custom.toml",
            "--workload",
            "mixgraph",
            "-n",
            "5",
            "-f",
            "0",
            "--output",
            "/tmp/runs",
            "--dry-run",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(cli.workload.as_deref(), Some("mixgraph"));
        assert_eq!(cli.iterations, Some(5));
        assert_eq!(cli.finetune_iterations, Some(0));
        assert_eq!(cli.output, Some(PathBuf::from("/tmp/runs")));
        assert!(cli.dry_run);
        assert!(cli.verbose);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["bench-sentinel"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("sentinel.toml"));
        assert_eq!(cli.workload, None);
        assert!(!cli.dry_run);
    }

    fn outcome(kind: retry::OutcomeKind, ops: Option<f64>) -> BenchmarkOutcome {
        BenchmarkOutcome {
            kind,
            output: String::new(),
            resources: Default::default(),
            options: "tuned".into(),
            extra_args: vec!["--bloom_bits=10".into()],
            results: parser::BenchResults {
                ops_per_sec: ops,
                ..Default::default()
            },
            attempts: 1,
            error: None,
        }
    }

    #[test]
    fn test_record_only_keeps_successes() {
        let mut history = TuningHistory::new("initial");
        let mut args = Vec::new();

        record(&mut history, &mut args, &outcome(retry::OutcomeKind::ConfigError, None));
        assert!(history.records().is_empty());
        assert!(args.is_empty());

        record(&mut history, &mut args, &outcome(retry::OutcomeKind::Success, Some(5.0)));
        assert_eq!(history.baseline(), Some(5.0));
        assert_eq!(history.known_good(), "tuned");
        assert_eq!(args, vec!["--bloom_bits=10".to_string()]);
    }
}
