//! Run directory layout.
//!
//! Every path the pipeline reads or writes is a deterministic function of
//! the run root plus a sample id / partition number / file kind --
//! [`RunContext`] is that function, replacing any notion of a single
//! process-global directory singleton with a value every stage threads
//! through explicitly. Layout:
//!
//! ```text
//! <root>/
//!   options.txt                       human-readable run parameters
//!   config_gatb/run_config.json       same parameters, machine-readable
//!   run_infos.txt                     wall time + peak RSS per run
//!   hash.info                         count width and hash seed in use
//!   repartition_gatb/repartition.minimRepart
//!   superkmers/<sample_id>/skp.<p>, PartiInfoFile, SuperKmerBinInfoFile
//!   counts/<sample_id>/kmer_count.<p>
//!   matrices/<kind>_<p>
//!   histograms/<sample_id>.hist
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KmtricksError;

/// Run-wide parameters persisted to both `options.txt` and
/// `config_gatb/run_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub k: usize,
    pub m: usize,
    pub partitions: u32,
    pub nb_samples: usize,
    pub minimizer_type: String,
    pub count_width_bytes: u8,
    /// The run's default abundance_min, used by any sample whose descriptor
    /// line doesn't pin its own (see [`crate::samples::AbundanceMin`]).
    pub min_count: u32,
    pub max_count: Option<u64>,
    pub min_recurrence: usize,
    /// Each sample's resolved abundance_min, keyed by sample id -- `merge`
    /// has no access to the original descriptor, so `count` persists the
    /// per-sample thresholds it resolved here.
    pub sample_abundance_min: std::collections::BTreeMap<String, u32>,
}

/// Deterministic paths for one pipeline run, rooted at a single directory.
#[derive(Debug, Clone)]
pub struct RunContext {
    root: PathBuf,
}

impl RunContext {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates every top-level subdirectory the run will write into.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] if a directory cannot be created.
    pub fn create_layout(&self) -> Result<(), KmtricksError> {
        for dir in [
            self.root.clone(),
            self.config_dir(),
            self.repartition_dir(),
            self.superkmers_dir(),
            self.counts_dir(),
            self.matrices_dir(),
            self.histograms_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| KmtricksError::io(dir, e))?;
        }
        Ok(())
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join("config_gatb")
    }

    fn repartition_dir(&self) -> PathBuf {
        self.root.join("repartition_gatb")
    }

    #[must_use]
    pub fn superkmers_dir(&self) -> PathBuf {
        self.root.join("superkmers")
    }

    #[must_use]
    pub fn counts_dir(&self) -> PathBuf {
        self.root.join("counts")
    }

    #[must_use]
    pub fn matrices_dir(&self) -> PathBuf {
        self.root.join("matrices")
    }

    fn histograms_dir(&self) -> PathBuf {
        self.root.join("histograms")
    }

    #[must_use]
    pub fn options_path(&self) -> PathBuf {
        self.root.join("options.txt")
    }

    #[must_use]
    pub fn run_config_path(&self) -> PathBuf {
        self.config_dir().join("run_config.json")
    }

    #[must_use]
    pub fn run_infos_path(&self) -> PathBuf {
        self.root.join("run_infos.txt")
    }

    #[must_use]
    pub fn hash_info_path(&self) -> PathBuf {
        self.root.join("hash.info")
    }

    #[must_use]
    pub fn repartition_table_path(&self) -> PathBuf {
        self.repartition_dir().join("repartition.minimRepart")
    }

    #[must_use]
    pub fn sample_superkmers_dir(&self, sample_id: &str) -> PathBuf {
        self.superkmers_dir().join(sample_id)
    }

    #[must_use]
    pub fn sample_counts_dir(&self, sample_id: &str) -> PathBuf {
        self.counts_dir().join(sample_id)
    }

    #[must_use]
    pub fn count_file_path(&self, sample_id: &str, partition: u32) -> PathBuf {
        self.sample_counts_dir(sample_id).join(format!("kmer_count.{partition}"))
    }

    #[must_use]
    pub fn matrix_file_path(&self, kind: &str, partition: u32) -> PathBuf {
        self.matrices_dir().join(format!("{kind}_{partition}"))
    }

    #[must_use]
    pub fn histogram_path(&self, sample_id: &str) -> PathBuf {
        self.histograms_dir().join(format!("{sample_id}.hist"))
    }

    /// Writes `config` to both `options.txt` (human-readable) and
    /// `config_gatb/run_config.json` (machine-readable).
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] on write failure or
    /// [`KmtricksError::Json`] if serialization fails.
    pub fn write_config(&self, config: &RunConfig) -> Result<(), KmtricksError> {
        let sample_abundance_min_text = config
            .sample_abundance_min
            .iter()
            .map(|(id, min)| format!("{id}={min}"))
            .collect::<Vec<_>>()
            .join(",");
        let options_text = format!(
            "k={}\nm={}\npartitions={}\nnb_samples={}\nminimizer_type={}\ncount_width_bytes={}\nmin_count={}\nmax_count={}\nmin_recurrence={}\nsample_abundance_min={}\n",
            config.k,
            config.m,
            config.partitions,
            config.nb_samples,
            config.minimizer_type,
            config.count_width_bytes,
            config.min_count,
            config.max_count.map_or_else(|| "none".to_string(), |m| m.to_string()),
            config.min_recurrence,
            sample_abundance_min_text,
        );
        std::fs::write(self.options_path(), options_text).map_err(|e| KmtricksError::io(self.options_path(), e))?;

        let json = serde_json::to_vec_pretty(config)?;
        std::fs::write(self.run_config_path(), json).map_err(|e| KmtricksError::io(self.run_config_path(), e))
    }

    /// Appends one run's wall time and best-effort peak RSS to
    /// `run_infos.txt`.
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] on write failure.
    pub fn append_run_info(&self, phase: &str, wall_time: Duration) -> Result<(), KmtricksError> {
        let rss = peak_rss_kb().map_or_else(|| "unknown".to_string(), |kb| kb.to_string());
        let line = format!("{phase}\twall_time_ms={}\tpeak_rss_kb={rss}\n", wall_time.as_millis());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_infos_path())
            .map_err(|e| KmtricksError::io(self.run_infos_path(), e))?;
        file.write_all(line.as_bytes()).map_err(|e| KmtricksError::io(self.run_infos_path(), e))
    }
}

/// Best-effort peak resident set size in KiB, read from
/// `/proc/self/status`. Returns `None` off Linux or if the field is
/// missing, rather than fail the run over an observability nicety.
#[must_use]
pub fn peak_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        line.strip_prefix("VmHWM:").map(|rest| rest.trim().trim_end_matches(" kB").trim().parse().ok()).flatten()
    })
}

/// Best-effort open-file soft limit, read from `/proc/self/limits`. Used to
/// size per-sample partition fan-out so the pipeline doesn't open more
/// files than the OS allows. Returns a conservative default off Linux.
#[must_use]
pub fn max_open_files() -> u64 {
    const FALLBACK: u64 = 256;
    let Ok(limits) = std::fs::read_to_string("/proc/self/limits") else {
        return FALLBACK;
    };
    limits
        .lines()
        .find(|line| line.starts_with("Max open files"))
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|soft| soft.parse().ok())
        .unwrap_or(FALLBACK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_layout_makes_every_subdirectory() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new(dir.path());
        ctx.create_layout().unwrap();
        assert!(dir.path().join("config_gatb").is_dir());
        assert!(dir.path().join("repartition_gatb").is_dir());
        assert!(dir.path().join("superkmers").is_dir());
        assert!(dir.path().join("counts").is_dir());
        assert!(dir.path().join("matrices").is_dir());
        assert!(dir.path().join("histograms").is_dir());
    }

    #[test]
    fn paths_are_deterministic_functions_of_root() {
        let ctx = RunContext::new("/tmp/run1");
        assert_eq!(ctx.count_file_path("sampleA", 3), PathBuf::from("/tmp/run1/counts/sampleA/kmer_count.3"));
        assert_eq!(ctx.matrix_file_path("matrix_count", 7), PathBuf::from("/tmp/run1/matrices/matrix_count_7"));
    }

    #[test]
    fn write_config_produces_both_files() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new(dir.path());
        ctx.create_layout().unwrap();
        let config = RunConfig {
            k: 21,
            m: 10,
            partitions: 16,
            nb_samples: 3,
            minimizer_type: "lexicographic".to_string(),
            count_width_bytes: 1,
            min_count: 2,
            max_count: None,
            min_recurrence: 1,
            sample_abundance_min: std::collections::BTreeMap::from([("a".to_string(), 2)]),
        };
        ctx.write_config(&config).unwrap();
        assert!(ctx.options_path().exists());
        let json = std::fs::read_to_string(ctx.run_config_path()).unwrap();
        let parsed: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn append_run_info_writes_a_line_per_call() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new(dir.path());
        ctx.append_run_info("binning", Duration::from_millis(120)).unwrap();
        ctx.append_run_info("counting", Duration::from_millis(80)).unwrap();
        let text = std::fs::read_to_string(ctx.run_infos_path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("wall_time_ms=120"));
    }

    #[test]
    fn max_open_files_never_panics() {
        // Just exercises both the Linux and fallback paths without asserting
        // a specific value, since the test environment's limit is unknown.
        let _ = max_open_files();
    }
}
