//! Out-of-core partitioned k-mer counting and k-mer-matrix construction.
//!
//! A run has three phases, each a hard barrier over the one before it:
//! binning every sample's sequences into per-partition super-k-mer files by
//! minimizer ([`repartition`], [`minimizer`], [`skm_store`]), counting each
//! sample's k-mers within a partition ([`counter`]), and n-way merging one
//! partition's per-sample counts into a matrix ([`merger`],
//! [`matrix_merge`], [`matrix_filter`]). [`layout`] fixes the on-disk
//! structure a run reads and writes; [`envelope`] is the typed binary
//! framing shared by every file kind; [`cli`] and the `kmerust` binary wire
//! the four subcommands (`count`, `merge`, `combine`, `filter`) onto these
//! modules.

pub mod cli;
pub mod counter;
pub mod envelope;
pub mod error;
pub mod format;
pub mod histogram;
pub mod input;
pub mod kmer;
pub mod layout;
pub mod lz4_stream;
pub mod matrix;
pub mod matrix_filter;
pub mod matrix_merge;
pub mod merger;
pub mod minimizer;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod repartition;
pub mod samples;
pub mod skm_store;
