/// Per-run output directory: every terminal attempt is archived as a numbered
/// options file with its metrics and reasoning appended as comments.
///
/// Layout under `<output_root>/output/<device>/<timestamp>/`:
///   options_file.ini          the options the benchmark reads
///   N.ini                     successful attempt N
///   N-incorrect_options.ini   failed attempt N
///   ops_per_sec_N.json        throughput series for successful attempt N
use crate::monitor::ResourceSnapshot;
use crate::parser::BenchResults;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

const OPTIONS_FILE: &str = "options_file.ini";

#[derive(Debug)]
pub enum ArchiveError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            ArchiveError::Serialize(e) => write!(f, "failed to serialize run record: {e}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Write { source, .. } => Some(source),
            ArchiveError::Serialize(e) => Some(e),
        }
    }
}

/// One terminal attempt to archive.
#[derive(Debug)]
pub struct ArchiveEntry<'a> {
    pub success: bool,
    pub options: &'a str,
    pub results: &'a BenchResults,
    pub resources: ResourceSnapshot,
    pub reasoning: &'a str,
    pub changed_values: &'a Value,
}

#[derive(Serialize)]
struct Series<'a> {
    ops_per_sec: Option<f64>,
    samples: &'a [f64],
}

#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    /// Create a fresh timestamped run directory.
    pub fn create(
        output_root: &Path,
        device: &str,
        now: DateTime<Local>,
    ) -> Result<Self, ArchiveError> {
        let dir = output_root
            .join("output")
            .join(device)
            .join(now.format("%Y-%m-%d_%H-%M-%S").to_string());
        std::fs::create_dir_all(&dir).map_err(|e| ArchiveError::Write {
            path: dir.clone(),
            source: e,
        })?;
        tracing::info!(dir = %dir.display(), "using output folder");
        Ok(Self { dir })
    }

    /// Use an existing directory as is.
    #[cfg(test)]
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Default location of the options file the benchmark reads.
    pub fn options_file(&self) -> PathBuf {
        self.dir.join(OPTIONS_FILE)
    }

    /// Default location of the trace model for `tracefile` runs.
    pub fn trace_model(&self) -> PathBuf {
        self.dir.join("trace_model.json")
    }

    /// Number of archived `.ini` files, which is the index of the next one.
    pub fn next_index(&self) -> usize {
        let pattern = self.dir.join("*.ini");
        let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
            return 0;
        };
        paths
            .filter_map(Result::ok)
            .filter(|p| p.file_name().is_some_and(|n| n != OPTIONS_FILE))
            .count()
    }

    /// Archive a terminal attempt. Returns the path of the `.ini` written.
    pub fn store(&self, entry: &ArchiveEntry<'_>) -> Result<PathBuf, ArchiveError> {
        let index = self.next_index();
        let name = if entry.success {
            format!("{index}.ini")
        } else {
            format!("{index}-incorrect_options.ini")
        };

        let mut text = entry.options.trim_end().to_string();
        text.push_str("\n\n# --- run record ---\n");
        for (label, value) in [
            ("results", serde_json::to_string(entry.results)),
            ("resources", serde_json::to_string(&entry.resources)),
            ("changed_values", serde_json::to_string(entry.changed_values)),
        ] {
            let value = value.map_err(ArchiveError::Serialize)?;
            text.push_str(&format!("# {label}: {value}\n"));
        }
        text.push_str("# reasoning:\n");
        for line in entry.reasoning.lines() {
            text.push_str(&format!("#   {line}\n"));
        }

        let path = self.dir.join(name);
        write_atomic(&path, text.as_bytes())?;

        if entry.success {
            let series = serde_json::to_vec_pretty(&Series {
                ops_per_sec: entry.results.ops_per_sec,
                samples: &entry.results.ops_series,
            })
            .map_err(ArchiveError::Serialize)?;
            write_atomic(&self.dir.join(format!("ops_per_sec_{index}.json")), &series)?;
        }

        tracing::info!(path = %path.display(), success = entry.success, "archived run");
        Ok(path)
    }
}

/// Write to a temp file in the same directory, then rename into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ArchiveError> {
    let write_err = |source| ArchiveError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
