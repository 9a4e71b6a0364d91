/// In-flight decision policy: when to restart a degraded run and when to push
/// a live retune instead.
///
/// The gate sees every output line with its time offset from launch. It
/// ignores everything during warmup, then evaluates at most once per check
/// interval using the first throughput-bearing line of that interval.
use crate::config::PolicyConfig;
use std::time::Duration;

const THROUGHPUT_MARKER: &str = "ops/second";

/// Operations per second estimated from one stats line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub ops_per_sec: f64,
}

impl ThroughputSample {
    /// Parse a db_bench interval stats line such as
    /// `... (12000,240000) ops and (12000.0,11800.5) ops/second in (1.0,20.3) seconds`.
    ///
    /// The figure is the second field of the second parenthesized tuple (the
    /// cumulative per-thread average), multiplied by `threads`.
    pub fn parse(line: &str, threads: u32) -> Option<Self> {
        if !line.contains(THROUGHPUT_MARKER) {
            return None;
        }
        let tuple = line.split('(').nth(2)?;
        let field = tuple.split(',').nth(1)?;
        let value: f64 = field.split(')').next()?.trim().parse().ok()?;
        Some(Self {
            ops_per_sec: value * f64::from(threads),
        })
    }
}

/// Tunables for the gate.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    pub warmup: Duration,
    pub check_interval: Duration,
    pub restart_ratio: f64,
    pub reconfigure_ratio: f64,
    pub max_restarts: u32,
    pub live_tuning: bool,
    pub threads: u32,
}

impl DecisionPolicy {
    pub fn from_config(policy: &PolicyConfig, threads: u32) -> Self {
        Self {
            warmup: policy.warmup(),
            check_interval: policy.check_interval(),
            restart_ratio: policy.restart_ratio,
            reconfigure_ratio: policy.reconfigure_ratio,
            max_restarts: policy.max_restarts,
            live_tuning: policy.live_tuning,
            threads,
        }
    }
}

/// What the controller should do after a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Nothing evaluated for this line.
    Wait,
    /// Evaluated; throughput is acceptable.
    Hold(ThroughputSample),
    /// Kill the run and start over with retuned options.
    Restart(ThroughputSample),
    /// Push retuned options into the running process.
    Reconfigure(ThroughputSample),
}

/// Per-attempt decision state.
#[derive(Debug)]
pub struct DecisionGate {
    policy: DecisionPolicy,
    baseline: f64,
    restarts_used: u32,
    warmed_up: bool,
    last_decision: Duration,
    missing_logged: bool,
    evaluations: u32,
}

impl DecisionGate {
    /// `restarts_used` counts restarts already spent earlier in this chain.
    pub fn new(policy: DecisionPolicy, baseline: f64, restarts_used: u32) -> Self {
        Self {
            policy,
            baseline,
            restarts_used,
            warmed_up: false,
            last_decision: Duration::ZERO,
            missing_logged: false,
            evaluations: 0,
        }
    }

    pub fn evaluations(&self) -> u32 {
        self.evaluations
    }

    /// Feed one output line seen `elapsed` after launch.
    pub fn observe(&mut self, elapsed: Duration, line: &str) -> Decision {
        if !self.warmed_up {
            if elapsed < self.policy.warmup {
                return Decision::Wait;
            }
            self.warmed_up = true;
            tracing::debug!(elapsed_secs = elapsed.as_secs(), "warmup over");
        }

        if elapsed.saturating_sub(self.last_decision) < self.policy.check_interval {
            return Decision::Wait;
        }

        let Some(sample) = ThroughputSample::parse(line, self.policy.threads) else {
            if !self.missing_logged {
                self.missing_logged = true;
                tracing::debug!("no throughput in output at check point");
            }
            return Decision::Wait;
        };

        self.last_decision = elapsed;
        self.missing_logged = false;
        self.evaluations += 1;

        let current = sample.ops_per_sec;
        if current < self.policy.restart_ratio * self.baseline
            && self.restarts_used < self.policy.max_restarts
        {
            return Decision::Restart(sample);
        }
        if self.policy.live_tuning && current < self.policy.reconfigure_ratio * self.baseline {
            return Decision::Reconfigure(sample);
        }
        Decision::Hold(sample)
    }
}
