/// Benchmark output parsing: engine errors, the final summary, and the
/// per-interval throughput series.
use crate::policy::ThroughputSample;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

// Engine failures are reported at line start, either as a bare status
// (`Corruption: ...`) or prefixed by the failing call (`open error: ...`).
// Statistics counters such as `rocksdb.*.corruption.*` must not match.
static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:Unable to load options|Invalid argument:|Corruption:|Not implemented:|IO error:|Failed to |Error:|\w+ error: ).*$",
    )
    .unwrap()
});

static SUMMARY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\w+)\s*:\s*([\d.]+) micros/op\s+([\d.]+) ops/sec(.*)$").unwrap()
});

static OPERATIONS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) operations;").unwrap());

static DATA_RATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+) ([KMGT]?B/s)").unwrap());

/// Fields extracted from one run's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BenchResults {
    /// First line that looks like an engine error.
    pub error: Option<String>,
    pub benchmark: Option<String>,
    pub micros_per_op: Option<f64>,
    pub ops_per_sec: Option<f64>,
    pub operations: Option<u64>,
    pub data_speed: Option<f64>,
    pub data_speed_unit: Option<String>,
    /// Interval throughput, one entry per stats line.
    pub ops_series: Vec<f64>,
}

impl BenchResults {
    /// Whether the run produced the throughput figure decisions depend on.
    pub fn has_metrics(&self) -> bool {
        self.ops_per_sec.is_some()
    }
}

pub trait OutputParser: Send + Sync {
    fn parse(&self, output: &str) -> BenchResults;
}

/// Parser for db_bench output.
#[derive(Debug, Clone, Copy)]
pub struct DbBenchParser {
    threads: u32,
}

impl DbBenchParser {
    pub fn new(threads: u32) -> Self {
        Self { threads }
    }
}

impl OutputParser for DbBenchParser {
    fn parse(&self, output: &str) -> BenchResults {
        let mut results = BenchResults {
            error: ERROR_PATTERN
                .find(output)
                .map(|m| m.as_str().trim().to_string()),
            ops_series: output
                .lines()
                .filter_map(|line| ThroughputSample::parse(line, self.threads))
                .map(|s| s.ops_per_sec)
                .collect(),
            ..Default::default()
        };

        if let Some(caps) = SUMMARY_PATTERN.captures_iter(output).last() {
            results.benchmark = Some(caps[1].to_string());
            results.micros_per_op = caps[2].parse().ok();
            results.ops_per_sec = caps[3].parse().ok();
            let rest = &caps[4];
            results.operations = OPERATIONS_PATTERN
                .captures(rest)
                .and_then(|c| c[1].parse().ok());
            if let Some(rate) = DATA_RATE_PATTERN.captures(rest) {
                results.data_speed = rate[1].parse().ok();
                results.data_speed_unit = Some(rate[2].to_string());
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILLRANDOM: &str = "\
RocksDB:    version 8.8.1
Keys:       16 bytes each
2024/05/01-10:00:01 ... thread 0: (1000,1000) ops and (320000.0,320000.0) ops/second in (1.0,1.0) seconds
2024/05/01-10:00:02 ... thread 0: (1000,2000) ops and (310000.0,315000.0) ops/second in (1.0,2.0) seconds
fillrandom   :       3.123 micros/op 320193 ops/sec 60.002 seconds 19212000 operations;   35.4 MB/s
";

    #[test]
    fn test_parses_summary_line() {
        let r = DbBenchParser::new(1).parse(FILLRANDOM);
        assert_eq!(r.error, None);
        assert_eq!(r.benchmark.as_deref(), Some("fillrandom"));
        assert_eq!(r.micros_per_op, Some(3.123));
        assert_eq!(r.ops_per_sec, Some(320193.0));
        assert_eq!(r.operations, Some(19212000));
        assert_eq!(r.data_speed, Some(35.4));
        assert_eq!(r.data_speed_unit.as_deref(), Some("MB/s"));
        assert!(r.has_metrics());
    }

    #[test]
    fn test_collects_series_scaled_by_threads() {
        let r = DbBenchParser::new(2).parse(FILLRANDOM);
        assert_eq!(r.ops_series, vec![640000.0, 630000.0]);
    }

    #[test]
    fn test_mixgraph_summary_without_data_rate() {
        let out = "mixgraph     :      12.345 micros/op 81004 ops/sec 200.001 seconds 16200100 operations; ( Gets:13500000 Puts:2200000 Seek:500000)\n";
        let r = DbBenchParser::new(1).parse(out);
        assert_eq!(r.ops_per_sec, Some(81004.0));
        assert_eq!(r.operations, Some(16200100));
        assert_eq!(r.data_speed, None);
        assert!(r.has_metrics());
    }

    #[test]
    fn test_detects_options_error() {
        let out = "Unable to load options file /tmp/options_file.ini --- Invalid argument: Unrecognized option DBOptions:: foo\n";
        let r = DbBenchParser::new(1).parse(out);
        assert!(r.error.as_deref().unwrap().contains("Invalid argument"));
        assert!(!r.has_metrics());
    }

    #[test]
    fn test_detects_status_prefixed_error() {
        let out = "RocksDB:    version 8.8.1\nopen error: IO error: No such file or directory: /db/LOCK\n";
        let r = DbBenchParser::new(1).parse(out);
        assert_eq!(
            r.error.as_deref(),
            Some("open error: IO error: No such file or directory: /db/LOCK")
        );
    }

    #[test]
    fn test_statistics_lines_are_not_errors() {
        let out = format!(
            "{FILLRANDOM}rocksdb.file.read.corruption.retry.count COUNT : 0\n\
             rocksdb.error.handler.bg.error.count COUNT : 0\n"
        );
        let r = DbBenchParser::new(1).parse(&out);
        assert_eq!(r.error, None);
        assert_eq!(r.ops_per_sec, Some(320193.0));
    }

    #[test]
    fn test_empty_output_has_no_metrics() {
        let r = DbBenchParser::new(1).parse("");
        assert_eq!(r, BenchResults::default());
    }
}
