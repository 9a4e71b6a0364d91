/// Local search around the options an advisor changed.
///
/// After a tuning iteration succeeds, every numeric option named in the
/// advisor's `changed_values` is scaled up and then down by the current step,
/// and each candidate is benchmarked. A faster candidate becomes the new best
/// and the next round searches around it. A round with no winner halves the
/// step's distance from 1.
use crate::controller::{merge_overrides, option_pair, section_header, RunRequest};
use crate::retry::{BenchmarkOutcome, RetryCoordinator, RetryState, TuningHistory};
use crate::runner::LaunchError;
use serde_json::Value;
use tracing::{debug, info};

/// A numeric option located in an options file.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunable {
    /// Header line of the enclosing section, if the file has sections.
    pub section: Option<String>,
    pub key: String,
    pub value: f64,
    pub integer: bool,
}

impl Tunable {
    fn scaled(&self, factor: f64) -> String {
        if self.integer {
            format!("{}", ((self.value * factor).round() as i64).max(1))
        } else {
            format!("{}", self.value * factor)
        }
    }
}

/// Option names the advisor reported as changed: the keys of an object, or
/// the strings of an array.
fn changed_keys(changed_values: &Value) -> Vec<&str> {
    match changed_values {
        Value::Object(map) => map.keys().map(String::as_str).collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Every occurrence of a changed option whose current value is a positive
/// number. Flags, enums and sentinel values like `-1` are left alone.
pub fn tunables(options: &str, changed_values: &Value) -> Vec<Tunable> {
    let keys = changed_keys(changed_values);
    let mut section = None;
    let mut found = Vec::new();
    for line in options.lines() {
        if let Some(header) = section_header(line) {
            section = Some(header);
            continue;
        }
        let Some((key, value)) = option_pair(line) else {
            continue;
        };
        if !keys.contains(&key) {
            continue;
        }
        let (value, integer) = match value.parse::<i64>() {
            Ok(v) => (v as f64, true),
            Err(_) => match value.parse::<f64>() {
                Ok(v) if v.is_finite() => (v, false),
                _ => continue,
            },
        };
        if value > 0.0 {
            found.push(Tunable {
                section: section.map(str::to_string),
                key: key.to_string(),
                value,
                integer,
            });
        }
    }
    found
}

/// `options` with every tunable multiplied by `factor`, in its own section.
pub fn scale(options: &str, tunables: &[Tunable], factor: f64) -> String {
    tunables.iter().fold(options.to_string(), |current, t| {
        let line = format!("{}={}", t.key, t.scaled(factor));
        let blob = match &t.section {
            Some(header) => format!("{header}\n{line}\n"),
            None => line,
        };
        merge_overrides(&current, &blob)
    })
}

pub struct FineTuner<'a> {
    coordinator: &'a RetryCoordinator<'a>,
    rounds: u32,
    step: f64,
}

impl<'a> FineTuner<'a> {
    pub fn new(coordinator: &'a RetryCoordinator<'a>, rounds: u32, step: f64) -> Self {
        Self {
            coordinator,
            rounds,
            step,
        }
    }

    /// Search around `start`, the successful outcome of `request`. Returns the
    /// fastest successful outcome seen, which is `start` when nothing beat it.
    pub async fn run(
        &self,
        request: &RunRequest,
        state: &RetryState,
        start: BenchmarkOutcome,
        history: &TuningHistory,
    ) -> Result<BenchmarkOutcome, LaunchError> {
        let Some(mut best_ops) = start.results.ops_per_sec.filter(|_| start.succeeded()) else {
            return Ok(start);
        };
        let mut best = start;
        if tunables(&best.options, &state.changed_values).is_empty() {
            debug!(iteration = request.iteration, "no numeric changed values to fine-tune");
            return Ok(best);
        }

        let mut step = self.step;
        for round in 1..=self.rounds {
            let mut improved = false;
            for factor in [step, 1.0 / step] {
                let around = tunables(&best.options, &state.changed_values);
                let candidate = RunRequest {
                    options: scale(&best.options, &around, factor),
                    extra_args: best.extra_args.clone(),
                    ..request.clone()
                };
                let candidate_state = RetryState {
                    attempt: 0,
                    reasoning: format!("fine-tune round {round}: scaled changed values by {factor:.3}"),
                    changed_values: state.changed_values.clone(),
                };
                let outcome = self
                    .coordinator
                    .run(candidate, candidate_state, history)
                    .await?;
                match outcome.results.ops_per_sec.filter(|_| outcome.succeeded()) {
                    Some(ops) if ops > best_ops => {
                        info!(round, factor, ops_per_sec = ops, previous = best_ops, "fine-tune candidate improved");
                        best_ops = ops;
                        best = outcome;
                        improved = true;
                        break;
                    }
                    ops => debug!(round, factor, ops_per_sec = ?ops, "fine-tune candidate not better"),
                }
            }
            if !improved {
                step = 1.0 + (step - 1.0) / 2.0;
            }
        }
        Ok(best)
    }
}
