use crate::advisor::{AdvisorQuery, TuningAdvisor, TuningRecord};
use crate::archive::{write_atomic, ArchiveEntry, RunArchive};
use crate::controller::{ExecutionController, RunRequest};
use crate::monitor::ResourceSnapshot;
use crate::parser::{BenchResults, OutputParser};
use crate::runner::LaunchError;
use serde_json::Value;
use tracing::warn;

/// How one terminal attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    /// The engine rejected the configuration.
    ConfigError,
    /// The run completed but reported no throughput.
    NoMetricsError,
}

impl OutcomeKind {
    pub fn classify(results: &BenchResults) -> Self {
        if results.error.is_some() {
            OutcomeKind::ConfigError
        } else if !results.has_metrics() {
            OutcomeKind::NoMetricsError
        } else {
            OutcomeKind::Success
        }
    }
}

/// Result of a correction chain, as seen by the caller.
#[derive(Debug, Clone)]
pub struct BenchmarkOutcome {
    pub kind: OutcomeKind,
    pub output: String,
    pub resources: ResourceSnapshot,
    /// Options of the last attempt, including live overrides.
    pub options: String,
    pub extra_args: Vec<String>,
    pub results: BenchResults,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Last observed error text, for failures.
    pub error: Option<String>,
}

impl BenchmarkOutcome {
    pub fn succeeded(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

/// Context carried from one correction attempt to the next.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// 0-based index of the attempt about to run.
    pub attempt: u32,
    /// Advisor reasoning that produced the current options.
    pub reasoning: String,
    pub changed_values: Value,
}

impl RetryState {
    pub fn new(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }
}

/// Configurations that produced metric-bearing runs, oldest first.
#[derive(Debug, Clone)]
pub struct TuningHistory {
    initial: String,
    records: Vec<TuningRecord>,
}

impl TuningHistory {
    /// `initial` is the rollback target until a run succeeds.
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            initial: initial.into(),
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TuningRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[TuningRecord] {
        &self.records
    }

    /// Options of the last successful run.
    pub fn known_good(&self) -> &str {
        self.records.last().map_or(&self.initial, |r| &r.options)
    }

    /// Throughput of the last successful run: the next baseline.
    pub fn baseline(&self) -> Option<f64> {
        self.records.last().map(|r| r.ops_per_sec)
    }
}

/// Decision returned by the retry policy after classifying an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt succeeded.
    Proceed,
    /// Correct the configuration and run again (1-based correction number).
    Retry { attempt: u32 },
    /// Correction budget spent; the failure is terminal.
    GiveUp,
}

/// Bounds correction attempts for one chain.
pub struct RetryPolicy {
    max_corrections: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_corrections: u32) -> Self {
        Self {
            max_corrections,
            current_attempt: 0,
        }
    }

    pub fn evaluate(&mut self, kind: OutcomeKind) -> RetryDecision {
        if kind == OutcomeKind::Success {
            return RetryDecision::Proceed;
        }
        if self.current_attempt < self.max_corrections {
            self.current_attempt += 1;
            warn!(
                ?kind,
                attempt = self.current_attempt,
                max_corrections = self.max_corrections,
                "benchmark failed, retrying with corrected options"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
            }
        } else {
            warn!(
                ?kind,
                max_corrections = self.max_corrections,
                "correction budget exhausted"
            );
            RetryDecision::GiveUp
        }
    }

    #[cfg(test)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Runs a request through the controller and corrects failed configurations.
pub struct RetryCoordinator<'a> {
    controller: &'a ExecutionController<'a>,
    advisor: &'a dyn TuningAdvisor,
    parser: &'a dyn OutputParser,
    archive: &'a RunArchive,
    max_corrections: u32,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(
        controller: &'a ExecutionController<'a>,
        advisor: &'a dyn TuningAdvisor,
        parser: &'a dyn OutputParser,
        archive: &'a RunArchive,
        max_corrections: u32,
    ) -> Self {
        Self {
            controller,
            advisor,
            parser,
            archive,
            max_corrections,
        }
    }

    /// Run until an attempt succeeds or the correction budget is spent.
    ///
    /// Each terminal attempt is archived. Before any further attempt the
    /// options file is rolled back to the last known-good configuration.
    pub async fn run(
        &self,
        request: RunRequest,
        state: RetryState,
        history: &TuningHistory,
    ) -> Result<BenchmarkOutcome, LaunchError> {
        let mut request = request;
        let mut state = state;
        let mut policy = RetryPolicy::new(self.max_corrections);
        policy.current_attempt = state.attempt.min(self.max_corrections);

        loop {
            let run = self
                .controller
                .run(request.clone(), history.baseline(), history.records())
                .await?;
            let results = self.parser.parse(&run.output);
            let kind = OutcomeKind::classify(&results);
            let error = match kind {
                OutcomeKind::Success => None,
                OutcomeKind::ConfigError => results.error.clone(),
                OutcomeKind::NoMetricsError => {
                    Some("benchmark completed without reporting ops/sec".to_string())
                }
            };

            let entry = ArchiveEntry {
                success: kind == OutcomeKind::Success,
                options: &run.options,
                results: &results,
                resources: run.resources,
                reasoning: &state.reasoning,
                changed_values: &state.changed_values,
            };
            if let Err(e) = self.archive.store(&entry) {
                warn!(error = %e, "failed to archive attempt");
            }

            let decision = policy.evaluate(kind);
            let outcome = BenchmarkOutcome {
                kind,
                output: run.output,
                resources: run.resources,
                options: run.options,
                extra_args: run.extra_args,
                results,
                attempts: state.attempt + 1,
                error,
            };
            if decision == RetryDecision::Proceed {
                tracing::info!(
                    iteration = request.iteration,
                    attempts = outcome.attempts,
                    ops_per_sec = ?outcome.results.ops_per_sec,
                    "benchmark succeeded"
                );
                return Ok(outcome);
            }

            self.rollback(history.known_good())?;

            let RetryDecision::Retry { attempt } = decision else {
                tracing::error!(
                    iteration = request.iteration,
                    attempts = outcome.attempts,
                    error = ?outcome.error,
                    "benchmark failed after all corrections"
                );
                return Ok(outcome);
            };

            let error_text = outcome.error.as_deref().unwrap_or_default();
            let query = AdvisorQuery::CorrectError {
                options: &outcome.options,
                extra_args: &outcome.extra_args,
                reasoning: &state.reasoning,
                changed_values: &state.changed_values,
                error: error_text,
                attempt,
            };
            match self.advisor.advise(&query).await {
                Ok(proposal) => {
                    request.options = proposal.options;
                    request.extra_args = proposal.extra_args;
                    state.reasoning = proposal.reasoning;
                    state.changed_values = proposal.changed_values;
                }
                Err(e) => {
                    warn!(error = %e, "advisor failed to correct options, retrying known-good");
                    request.options = history.known_good().to_string();
                    state.reasoning = format!("advisor unavailable: {e}");
                }
            }
            state.attempt = attempt;
        }
    }

    fn rollback(&self, known_good: &str) -> Result<(), LaunchError> {
        let path = &self.controller.paths().options_file;
        write_atomic(path, known_good.as_bytes()).map_err(|e| LaunchError::Prepare {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        tracing::info!(path = %path.display(), "rolled back to known-good options");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorError, AdvisorFuture, Proposal};
    use crate::config::SentinelConfig;
    use crate::controller::RunPaths;
    use crate::diagnostics::{Diagnostics, SummaryFuture};
    use crate::parser::DbBenchParser;
    use crate::runner::{Launcher, WorkloadProcess};
    use crate::workload::Workload;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    const SUMMARY: &str =
        "fillrandom   :       3.123 micros/op 320193 ops/sec 60.002 seconds 19212000 operations;   35.4 MB/s";
    const REJECTED: &str = "Invalid argument: Unrecognized option DBOptions:: bogus";

    struct Outputs(Mutex<VecDeque<&'static str>>);

    impl Outputs {
        fn new(lines: &[&'static str]) -> Self {
            Self(Mutex::new(lines.iter().copied().collect()))
        }
    }

    impl Launcher for Outputs {
        fn launch(&self, _argv: &[String]) -> Result<WorkloadProcess, LaunchError> {
            let next = self.0.lock().unwrap().pop_front().unwrap_or(REJECTED);
            Ok(WorkloadProcess::scripted(vec![next.to_string()]))
        }
    }

    /// Records correction queries and the options file as it stood at each one.
    struct Corrector {
        options_file: PathBuf,
        attempts: Mutex<Vec<u32>>,
        on_disk: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Corrector {
        fn new(options_file: &Path) -> Self {
            Self {
                options_file: options_file.to_path_buf(),
                attempts: Mutex::new(Vec::new()),
                on_disk: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl TuningAdvisor for Corrector {
        fn advise(&self, query: &AdvisorQuery<'_>) -> AdvisorFuture<'_> {
            Box::pin(std::future::ready(self.answer(query)))
        }
    }

    impl Corrector {
        fn answer(&self, query: &AdvisorQuery<'_>) -> Result<Proposal, AdvisorError> {
            let AdvisorQuery::CorrectError { attempt, error, .. } = query else {
                panic!("unexpected query {}", query.kind());
            };
            assert!(!error.is_empty());
            self.attempts.lock().unwrap().push(*attempt);
            self.on_disk
                .lock()
                .unwrap()
                .push(std::fs::read_to_string(&self.options_file).unwrap());
            if self.fail {
                return Err(AdvisorError::Failed {
                    status: Some(1),
                    stderr: String::new(),
                });
            }
            Ok(Proposal {
                options: format!("[DBOptions]\n  fixed={attempt}\n"),
                reasoning: format!("fix {attempt}"),
                ..Default::default()
            })
        }
    }

    struct NoDiagnostics;

    impl Diagnostics for NoDiagnostics {
        fn device_info(&self, _db_path: &Path) -> String {
            String::new()
        }

        fn trace_summary(&self, _trace_file: &Path, _last_lines: Option<usize>) -> SummaryFuture<'_> {
            Box::pin(std::future::ready(String::new()))
        }
    }

    fn setup() -> (TempDir, SentinelConfig, RunPaths, RunArchive) {
        let dir = tempdir().unwrap();
        let mut config = SentinelConfig::default();
        config.prepare.wipe_db = false;
        config.prepare.drop_caches = false;
        config.prepare.settle_secs = 0;
        config.policy.side_checker = false;
        let archive = RunArchive::open(dir.path());
        let paths = RunPaths {
            options_file: archive.options_file(),
            trace_model: archive.trace_model(),
            tuning_channel: dir.path().join("tuning.mmap"),
        };
        (dir, config, paths, archive)
    }

    fn request(dir: &TempDir, options: &str) -> RunRequest {
        RunRequest {
            bench_binary: PathBuf::from("db_bench"),
            db_path: dir.path().join("db"),
            iteration: 0,
            workload: Workload::FillRandom,
            extra_args: Vec::new(),
            options: options.to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (dir, config, paths, archive) = setup();
        let launcher = Outputs::new(&[SUMMARY]);
        let advisor = Corrector::new(&paths.options_file);
        let parser = DbBenchParser::new(1);
        let controller =
            ExecutionController::new(&config, &paths, &launcher, &advisor, &NoDiagnostics);
        let coordinator = RetryCoordinator::new(&controller, &advisor, &parser, &archive, 2);

        let outcome = coordinator
            .run(
                request(&dir, "[DBOptions]\n"),
                RetryState::new("baseline"),
                &TuningHistory::new("[DBOptions]\n"),
            )
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.results.ops_per_sec, Some(320193.0));
        assert!(dir.path().join("0.ini").exists());
        assert!(advisor.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_uses_whole_budget() {
        let (dir, config, paths, archive) = setup();
        let launcher = Outputs::new(&[REJECTED, REJECTED, REJECTED, SUMMARY]);
        let advisor = Corrector::new(&paths.options_file);
        let parser = DbBenchParser::new(1);
        let controller =
            ExecutionController::new(&config, &paths, &launcher, &advisor, &NoDiagnostics);
        let coordinator = RetryCoordinator::new(&controller, &advisor, &parser, &archive, 2);

        let outcome = coordinator
            .run(
                request(&dir, "bogus=1\n"),
                RetryState::default(),
                &TuningHistory::new("[DBOptions]\n"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.kind, OutcomeKind::ConfigError);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.unwrap().contains("Unrecognized option"));
        assert_eq!(outcome.options, "[DBOptions]\n  fixed=2\n");
        assert_eq!(*advisor.attempts.lock().unwrap(), vec![1, 2]);
        // The unused success output proves no fourth launch happened.
        assert_eq!(launcher.0.lock().unwrap().len(), 1);
        for i in 0..3 {
            assert!(dir.path().join(format!("{i}-incorrect_options.ini")).exists());
        }
    }

    #[tokio::test]
    async fn test_rollback_precedes_every_retry() {
        let (dir, config, paths, archive) = setup();
        let launcher = Outputs::new(&[REJECTED, REJECTED, REJECTED]);
        let advisor = Corrector::new(&paths.options_file);
        let parser = DbBenchParser::new(1);
        let controller =
            ExecutionController::new(&config, &paths, &launcher, &advisor, &NoDiagnostics);
        let coordinator = RetryCoordinator::new(&controller, &advisor, &parser, &archive, 2);

        let mut history = TuningHistory::new("[DBOptions]\n  initial=1\n");
        history.push(TuningRecord {
            options: "[DBOptions]\n  known_good=1\n".into(),
            ops_per_sec: 1000.0,
        });
        coordinator
            .run(request(&dir, "bogus=1\n"), RetryState::default(), &history)
            .await
            .unwrap();

        let on_disk = advisor.on_disk.lock().unwrap().clone();
        assert_eq!(on_disk.len(), 2);
        assert!(on_disk.iter().all(|o| o == "[DBOptions]\n  known_good=1\n"));
        // A terminal failure also leaves the known-good file in place.
        assert_eq!(
            std::fs::read_to_string(&paths.options_file).unwrap(),
            "[DBOptions]\n  known_good=1\n"
        );
    }

    #[tokio::test]
    async fn test_missing_metrics_is_retried() {
        let (dir, config, paths, archive) = setup();
        let launcher = Outputs::new(&["DB path: [/tmp/db]", SUMMARY]);
        let advisor = Corrector::new(&paths.options_file);
        let parser = DbBenchParser::new(1);
        let controller =
            ExecutionController::new(&config, &paths, &launcher, &advisor, &NoDiagnostics);
        let coordinator = RetryCoordinator::new(&controller, &advisor, &parser, &archive, 2);

        let outcome = coordinator
            .run(
                request(&dir, "[DBOptions]\n"),
                RetryState::default(),
                &TuningHistory::new("[DBOptions]\n"),
            )
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        assert!(dir.path().join("0-incorrect_options.ini").exists());
        assert!(dir.path().join("1.ini").exists());
    }

    #[tokio::test]
    async fn test_advisor_failure_retries_known_good() {
        let (dir, config, paths, archive) = setup();
        let launcher = Outputs::new(&[REJECTED, SUMMARY]);
        let mut advisor = Corrector::new(&paths.options_file);
        advisor.fail = true;
        let parser = DbBenchParser::new(1);
        let controller =
            ExecutionController::new(&config, &paths, &launcher, &advisor, &NoDiagnostics);
        let coordinator = RetryCoordinator::new(&controller, &advisor, &parser, &archive, 2);

        let outcome = coordinator
            .run(
                request(&dir, "bogus=1\n"),
                RetryState::default(),
                &TuningHistory::new("[DBOptions]\n  initial=1\n"),
            )
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.options, "[DBOptions]\n  initial=1\n");
    }

    #[test]
    fn test_classify() {
        let ok = BenchResults {
            ops_per_sec: Some(1.0),
            ..Default::default()
        };
        assert_eq!(OutcomeKind::classify(&ok), OutcomeKind::Success);
        let rejected = BenchResults {
            error: Some("Invalid argument".into()),
            ops_per_sec: Some(1.0),
            ..Default::default()
        };
        assert_eq!(OutcomeKind::classify(&rejected), OutcomeKind::ConfigError);
        assert_eq!(
            OutcomeKind::classify(&BenchResults::default()),
            OutcomeKind::NoMetricsError
        );
    }

    #[test]
    fn test_statistics_dump_classifies_as_success() {
        let output = format!(
            "{SUMMARY}\nrocksdb.file.read.corruption.retry.count COUNT : 0\n\
             rocksdb.block.cache.add.failures COUNT : 0\n"
        );
        let results = DbBenchParser::new(1).parse(&output);
        assert_eq!(OutcomeKind::classify(&results), OutcomeKind::Success);
    }

    #[test]
    fn test_proceed_on_success() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(policy.evaluate(OutcomeKind::Success), RetryDecision::Proceed);
        assert_eq!(policy.current_attempt(), 0);
    }

    #[test]
    fn test_give_up_after_max_corrections() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(
            policy.evaluate(OutcomeKind::ConfigError),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            policy.evaluate(OutcomeKind::NoMetricsError),
            RetryDecision::Retry { attempt: 2 }
        );
        assert_eq!(policy.evaluate(OutcomeKind::ConfigError), RetryDecision::GiveUp);
        assert_eq!(policy.current_attempt(), 2);
    }

    #[test]
    fn test_zero_corrections_gives_up_immediately() {
        let mut policy = RetryPolicy::new(0);
        assert_eq!(policy.evaluate(OutcomeKind::ConfigError), RetryDecision::GiveUp);
    }

    #[test]
    fn test_history_known_good_falls_back_to_initial() {
        let mut history = TuningHistory::new("initial");
        assert_eq!(history.known_good(), "initial");
        assert_eq!(history.baseline(), None);
        history.push(TuningRecord {
            options: "tuned".into(),
            ops_per_sec: 42.0,
        });
        assert_eq!(history.known_good(), "tuned");
        assert_eq!(history.baseline(), Some(42.0));
    }
}
