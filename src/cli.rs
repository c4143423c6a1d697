//! Command-line interface definition.
//!
//! One binary, four subcommands mirroring the pipeline's phases: `count`
//! bins and counts every sample into per-partition k-mer count files and
//! per-sample histograms; `merge` n-way merges a partition's count files
//! into a matrix; `combine` aggregates matrices from independent runs that
//! share a repartition table; `filter` folds one more sample's counts into
//! an already-merged matrix as a new column.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Out-of-core partitioned k-mer counting and matrix construction.
#[derive(Parser, Debug)]
#[command(name = "kmerust")]
#[command(version, author, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bin every sample's super-k-mers by minimizer partition, then count
    /// each partition's canonical k-mers.
    Count(CountArgs),
    /// N-way merge one partition's per-sample count files into a matrix.
    Merge(MergeArgs),
    /// Combine matrices from independent runs sharing a repartition table.
    Combine(CombineArgs),
    /// Fold a new sample's counts into an already-merged matrix as a new
    /// column.
    Filter(FilterArgs),
}

#[derive(Parser, Debug)]
pub struct CountArgs {
    /// Sample descriptor file (see [`crate::samples`]).
    pub descriptor: PathBuf,

    /// K-mer length (1-32).
    #[arg(short = 'k', long, value_parser = parse_k)]
    pub k: usize,

    /// Minimizer length (must be less than k).
    #[arg(short = 'm', long, default_value = "10")]
    pub m: usize,

    /// Number of minimizer partitions.
    #[arg(short = 'p', long, default_value = "16")]
    pub partitions: u32,

    /// Run directory to write into.
    #[arg(short = 'd', long = "run-dir")]
    pub run_dir: PathBuf,

    /// Run-wide default minimum abundance a count must meet to be solid
    /// (overridden per-sample by a `! abundance_min` descriptor suffix).
    #[arg(long, default_value = "1")]
    pub min_count: u32,

    /// Maximum abundance to keep (unbounded if omitted).
    #[arg(long)]
    pub max_count: Option<u64>,

    /// Per-count-slot width.
    #[arg(long, value_enum, default_value = "u32")]
    pub width: CliCountWidth,

    /// Rank minimizers by descending sample frequency instead of
    /// lexicographically.
    #[arg(long)]
    pub frequency_order: bool,
}

#[derive(Parser, Debug)]
pub struct MergeArgs {
    /// Run directory produced by a prior `count`.
    #[arg(short = 'd', long = "run-dir")]
    pub run_dir: PathBuf,

    /// Partition to merge.
    #[arg(short = 'p', long)]
    pub partition: u32,

    /// Output matrix shape.
    #[arg(long, value_enum, default_value = "count-matrix")]
    pub shape: MatrixShape,

    /// Per-count-slot width (must match the `count` run).
    #[arg(long, value_enum, default_value = "u32")]
    pub width: CliCountWidth,

    /// Minimum number of samples a k-mer must be solid in to be kept.
    #[arg(long, default_value = "1")]
    pub min_recurrence: usize,

    /// Rescue an otherwise-dropped row once solid-plus-rescued samples
    /// would reach this count (a sample counts toward rescue only if its
    /// count is nonzero but below its own `abundance_min`).
    #[arg(long)]
    pub save_if: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct CombineArgs {
    /// Run directories to combine; must share a byte-identical repartition
    /// table.
    pub runs: Vec<PathBuf>,

    /// Partition to combine.
    #[arg(short = 'p', long)]
    pub partition: u32,

    /// Output path for the combined matrix.
    #[arg(short = 'o', long)]
    pub output: PathBuf,
}

#[derive(Parser, Debug)]
pub struct FilterArgs {
    /// Merged matrix file to add a column to (as produced by `merge`).
    pub matrix: PathBuf,

    /// A new sample's `KmerCount` file (as produced by `count`) to fold
    /// into the matrix as an extra column.
    pub new_sample: PathBuf,

    /// Output path for the matrix with the new sample's column appended.
    #[arg(long = "matrix-out")]
    pub matrix_out: PathBuf,

    /// Output path for the new column's counts, one decimal value per
    /// line, in the matrix's k-mer order.
    #[arg(long = "vec-out")]
    pub vec_out: PathBuf,

    /// Output path for the new sample's k-mers absent from the matrix,
    /// one `kmer_bits\tcount` pair per line.
    #[arg(long = "kmer-out")]
    pub kmer_out: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliCountWidth {
    U8,
    U16,
    U32,
}

impl From<CliCountWidth> for crate::envelope::CountWidth {
    fn from(w: CliCountWidth) -> Self {
        match w {
            CliCountWidth::U8 => Self::U8,
            CliCountWidth::U16 => Self::U16,
            CliCountWidth::U32 => Self::U32,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MatrixShape {
    /// Raw k-mer plus per-sample counts.
    CountMatrix,
    /// Raw k-mer plus per-sample presence bits.
    PaMatrix,
    /// Hash-keyed per-sample counts (no raw k-mer stored).
    MatrixHashCount,
    /// Hash-keyed per-sample presence bits.
    PaMatrixHash,
    /// Per-sample bit vectors (transpose of `pa-matrix`'s columns).
    Vector,
}

fn parse_k(s: &str) -> Result<usize, String> {
    let k: usize = s.parse().map_err(|_| format!("'{s}' is not a valid number"))?;
    if k == 0 {
        return Err("k-mer length must be at least 1".to_string());
    }
    if k > 32 {
        return Err("k-mer length must be at most 32".to_string());
    }
    Ok(k)
}
