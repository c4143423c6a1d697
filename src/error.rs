//! Error types for kmerust.
//!
//! [`KmtricksError`] is the crate-wide error taxonomy and follows the
//! classes named in the pipeline's error-handling design: `InputError`,
//! `FormatError`, `PipelineError`, `IoError`, `OutOfMemory`, `Cancelled`.
//! Every fatal error carries enough context (a path, a class) to produce the
//! single-line diagnostic the CLI prints on `stderr`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur anywhere in the kmerust pipeline.
#[derive(Debug, Error)]
pub enum KmtricksError {
    /// Malformed sample descriptor, mismatched repartition tables on merge,
    /// or otherwise unreadable/inconsistent input.
    #[error("input error: {0}")]
    Input(String),

    /// Bad magic, version mismatch, truncated file, or wrong kind for the
    /// requested operation.
    #[error("format error in '{path}': {details}")]
    Format { path: PathBuf, details: String },

    /// Requested partition out of range, k-mer size exceeds the compile-time
    /// bound, or another pipeline precondition was violated.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Underlying file operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bump-pointer arena (or a fixed-size buffer sized from a sampling
    /// estimate) was exceeded.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A cancel flag was observed at a task boundary before completion.
    #[error("cancelled")]
    Cancelled,

    /// Invalid k-mer length.
    #[error(transparent)]
    KmerLength(#[from] KmerLengthError),

    /// Encountered an invalid DNA base.
    #[error(transparent)]
    InvalidBase(#[from] InvalidBaseError),

    /// JSON (de)serialization failure, e.g. for `run_config.json`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KmtricksError {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn format(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            details: details.into(),
        }
    }

    #[must_use]
    pub fn input(details: impl Into<String>) -> Self {
        Self::Input(details.into())
    }

    #[must_use]
    pub fn pipeline(details: impl Into<String>) -> Self {
        Self::Pipeline(details.into())
    }

    /// A short, single-line diagnostic: class and a one-line "what to do".
    #[must_use]
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Input(msg) => format!("InputError: {msg} -- check the sample descriptor file"),
            Self::Format { path, details } => format!(
                "FormatError: {} ({details}) -- the file is truncated, from a different run, or was not produced by this pipeline",
                path.display()
            ),
            Self::Pipeline(msg) => format!("PipelineError: {msg} -- check run parameters (k, partition count)"),
            Self::Io { path, source } => {
                format!("IOError: {} ({source}) -- check permissions and free disk space", path.display())
            }
            Self::OutOfMemory(msg) => format!("OutOfMemory: {msg} -- lower partition count or raise the memory budget"),
            Self::Cancelled => "CancelledError: run was cancelled before completion".to_string(),
            Self::KmerLength(e) => format!("PipelineError: {e}"),
            Self::InvalidBase(e) => format!("InputError: {e}"),
            Self::Json(e) => format!("InputError: invalid JSON ({e})"),
        }
    }
}

impl From<std::io::Error> for KmtricksError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

/// Error for invalid k-mer length.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("k-mer length {k} is out of range: must be between {min} and {max}")]
pub struct KmerLengthError {
    /// The invalid k value that was provided.
    pub k: usize,
    /// Minimum valid k-mer length.
    pub min: u8,
    /// Maximum valid k-mer length.
    pub max: u8,
}

/// Error for invalid DNA base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBaseError {
    /// The invalid byte value.
    pub base: u8,
    /// Position of the invalid byte in the sequence.
    pub position: usize,
}

impl std::fmt::Display for InvalidBaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.base.is_ascii_graphic() || self.base == b' ' {
            write!(
                f,
                "invalid base '{}' (0x{:02x}) at position {}",
                self.base as char, self.base, self.position
            )
        } else {
            write!(
                f,
                "invalid base 0x{:02x} at position {}",
                self.base, self.position
            )
        }
    }
}

impl std::error::Error for InvalidBaseError {}
