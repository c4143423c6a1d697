//! Sample descriptor parsing.
//!
//! A run takes a "file of files" describing one or more samples, each
//! either a single sequence file or several (e.g. paired-end reads to be
//! pooled into one sample). One line per sample:
//!
//! ```text
//! sample_id: path/to/a.fq ; path/to/b.fq ! abundance_min
//! ```
//!
//! The id before `:` must be unique across the descriptor; a comma is also
//! accepted as a path separator alongside `;`. The trailing `! abundance_min`
//! is optional: a bare `u32` pins this sample's abundance threshold, `auto`
//! asks the counter to pick one from this sample's k-mer spectrum, and
//! omitting it (or writing `! 0`) falls back to the run's default. Blank
//! lines and lines starting with `#` are ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::KmtricksError;
use crate::histogram::Histogram;

/// A sample's per-sample abundance threshold, as written in its descriptor
/// line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbundanceMin {
    /// No per-sample override: use the run's default threshold.
    RunDefault,
    /// Pick a threshold from this sample's own k-mer spectrum.
    Auto,
    /// An explicit, fixed threshold.
    Value(u32),
}

impl AbundanceMin {
    /// Resolves this sample's threshold to a concrete `u32`, given the
    /// run's default and, for [`Self::Auto`], this sample's histogram.
    #[must_use]
    pub fn resolve(self, run_default: u32, histogram: &Histogram) -> u32 {
        match self {
            Self::RunDefault => run_default,
            Self::Value(v) => v,
            Self::Auto => histogram.auto_cutoff().unwrap_or(run_default),
        }
    }
}

/// One sample: a stable id, the sequence file(s) that make it up, and its
/// abundance threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub files: Vec<PathBuf>,
    pub abundance_min: AbundanceMin,
}

fn parse_abundance_min(text: &str, line_no: usize, id: &str) -> Result<AbundanceMin, KmtricksError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("auto") {
        return Ok(AbundanceMin::Auto);
    }
    let value: u32 = text
        .parse()
        .map_err(|_| KmtricksError::input(format!("line {line_no}: sample '{id}' has invalid abundance_min '{text}'")))?;
    Ok(if value == 0 { AbundanceMin::RunDefault } else { AbundanceMin::Value(value) })
}

/// Parses a sample descriptor's text into an ordered list of samples.
///
/// # Errors
/// Returns [`KmtricksError::Input`] on a malformed line, a sample with no
/// files, a duplicate sample id, or an unparseable `abundance_min` suffix.
pub fn parse_descriptor(text: &str) -> Result<Vec<Sample>, KmtricksError> {
    let mut seen_ids = HashSet::new();
    let mut samples = Vec::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (id, rest) = line
            .split_once(':')
            .ok_or_else(|| KmtricksError::input(format!("line {line_no}: expected 'sample_id: path[; path...]'")))?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(KmtricksError::input(format!("line {line_no}: empty sample id")));
        }
        if !seen_ids.insert(id.clone()) {
            return Err(KmtricksError::input(format!("duplicate sample id '{id}'")));
        }

        let (paths_part, abundance_min) = match rest.rsplit_once('!') {
            Some((paths, suffix)) => (paths, parse_abundance_min(suffix, line_no, &id)?),
            None => (rest, AbundanceMin::RunDefault),
        };

        let files: Vec<PathBuf> = paths_part
            .split([';', ','])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if files.is_empty() {
            return Err(KmtricksError::input(format!("line {line_no}: sample '{id}' has no files")));
        }

        samples.push(Sample { id, files, abundance_min });
    }

    if samples.is_empty() {
        return Err(KmtricksError::input("sample descriptor is empty"));
    }
    Ok(samples)
}

/// Reads and parses a sample descriptor file.
///
/// # Errors
/// Returns [`KmtricksError::Io`] if the file cannot be read, or
/// [`KmtricksError::Input`] if its contents are malformed.
pub fn load_descriptor(path: &Path) -> Result<Vec<Sample>, KmtricksError> {
    let text = std::fs::read_to_string(path).map_err(|e| KmtricksError::io(path, e))?;
    parse_descriptor(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_file_samples() {
        let text = "a: reads_a.fq\nb: reads_b.fq\n";
        let samples = parse_descriptor(text).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].id, "a");
        assert_eq!(samples[0].files, vec![PathBuf::from("reads_a.fq")]);
        assert_eq!(samples[0].abundance_min, AbundanceMin::RunDefault);
    }

    #[test]
    fn parses_multi_file_sample_with_semicolon_or_comma() {
        let text = "a: r1.fq ; r2.fq\nb: s1.fq, s2.fq\n";
        let samples = parse_descriptor(text).unwrap();
        assert_eq!(samples[0].files, vec![PathBuf::from("r1.fq"), PathBuf::from("r2.fq")]);
        assert_eq!(samples[1].files, vec![PathBuf::from("s1.fq"), PathBuf::from("s2.fq")]);
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let text = "# comment\n\na: r.fq\n\n";
        let samples = parse_descriptor(text).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn rejects_duplicate_sample_ids() {
        let text = "a: r1.fq\na: r2.fq\n";
        let err = parse_descriptor(text).unwrap_err();
        assert!(matches!(err, KmtricksError::Input(_)));
    }

    #[test]
    fn rejects_line_without_colon() {
        let text = "not a valid line\n";
        assert!(parse_descriptor(text).is_err());
    }

    #[test]
    fn rejects_sample_with_no_files() {
        let text = "a:\n";
        assert!(parse_descriptor(text).is_err());
    }

    #[test]
    fn rejects_empty_descriptor() {
        assert!(parse_descriptor("\n# only comments\n").is_err());
    }

    #[test]
    fn parses_explicit_abundance_min_suffix() {
        let samples = parse_descriptor("a: r.fq ! 3\n").unwrap();
        assert_eq!(samples[0].abundance_min, AbundanceMin::Value(3));
    }

    #[test]
    fn parses_auto_abundance_min_case_insensitively() {
        let samples = parse_descriptor("a: r.fq ! Auto\n").unwrap();
        assert_eq!(samples[0].abundance_min, AbundanceMin::Auto);
    }

    #[test]
    fn zero_abundance_min_means_run_default() {
        let samples = parse_descriptor("a: r.fq ! 0\n").unwrap();
        assert_eq!(samples[0].abundance_min, AbundanceMin::RunDefault);
    }

    #[test]
    fn multi_file_sample_with_abundance_min_suffix() {
        let samples = parse_descriptor("a: r1.fq ; r2.fq ! 5\n").unwrap();
        assert_eq!(samples[0].files, vec![PathBuf::from("r1.fq"), PathBuf::from("r2.fq")]);
        assert_eq!(samples[0].abundance_min, AbundanceMin::Value(5));
    }

    #[test]
    fn rejects_unparseable_abundance_min_suffix() {
        let err = parse_descriptor("a: r.fq ! not-a-number\n").unwrap_err();
        assert!(matches!(err, KmtricksError::Input(_)));
    }
}
