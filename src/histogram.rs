//! K-mer abundance histogram: count of counts, clipped to 255 bins.
//!
//! Every counting and merging stage that sees per-k-mer abundances updates a
//! [`Histogram`]: a fixed `H = 255` array where bin `i` (for `1 <= i <
//! 255`) holds the number of distinct k-mers observed exactly `i` times, and
//! bin 255 accumulates every k-mer seen 255 times or more. Bin 0 is unused
//! (abundance-filtered-out k-mers never reach the histogram). Histograms add
//! bin-wise, so per-partition histograms for one sample merge into one
//! per-sample histogram with a single pass.

use std::io;

use crate::envelope::{FileHeader, HistHeader, PartitionReader, PartitionWriter};

/// Number of bins, matching the on-disk `Hist` record count.
pub const H: usize = 255;

/// A k-mer abundance histogram for one sample: `bins[i]` is the number of
/// distinct k-mers seen with abundance `i` (abundance `>= H` clipped into
/// the last bin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    bins: [u64; H],
}

impl Default for Histogram {
    fn default() -> Self {
        Self { bins: [0; H] }
    }
}

impl Histogram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one k-mer observed with abundance `count` (`count == 0` is a
    /// no-op: filtered-out k-mers never reach the histogram).
    pub fn record(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        #[allow(clippy::cast_possible_truncation)]
        let bin = count.min(H as u64 - 1) as usize;
        self.bins[bin] += 1;
    }

    #[must_use]
    pub fn bin(&self, abundance: usize) -> u64 {
        self.bins[abundance.min(H - 1)]
    }

    #[must_use]
    pub fn bins(&self) -> &[u64; H] {
        &self.bins
    }

    /// Adds `other`'s bins into `self` bin-wise (used to combine
    /// per-partition histograms into one per-sample histogram).
    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
    }

    #[must_use]
    pub fn total_distinct(&self) -> u64 {
        self.bins.iter().sum()
    }

    #[must_use]
    pub fn total_occurrences(&self) -> u64 {
        self.bins
            .iter()
            .enumerate()
            .map(|(i, &n)| i as u64 * n)
            .sum()
    }

    /// Guesses an abundance threshold from the shape of the spectrum: the
    /// first local minimum at or past abundance 2, the valley between
    /// sequencing-error k-mers and genuinely covered ones. Returns `None`
    /// on a monotonic histogram (too little signal to find a valley), so
    /// the caller should fall back to a fixed default.
    #[must_use]
    pub fn auto_cutoff(&self) -> Option<u32> {
        (2..H - 1)
            .find(|&i| self.bins[i - 1] > self.bins[i] && self.bins[i] < self.bins[i + 1])
            .map(|i| i as u32)
    }

    /// Writes the histogram as a `Hist`-kind partition file: one `u64`
    /// record per bin, in order.
    ///
    /// # Errors
    /// Returns an `io::Error` on write failure.
    pub fn write_to<W: std::io::Write>(&self, inner: W, sample_id: u32, k: u8) -> io::Result<W> {
        let header = FileHeader::Hist(HistHeader { sample_id, k });
        let mut w = PartitionWriter::new(inner, header, false)?;
        for &count in &self.bins {
            w.write_record(&count.to_le_bytes())?;
        }
        w.finish()
    }

    /// Reads a histogram previously written by [`Self::write_to`].
    ///
    /// # Errors
    /// Returns [`crate::error::KmtricksError`] on a malformed or truncated file.
    pub fn read_from<R: std::io::Read>(inner: R, path: &std::path::Path) -> Result<Self, crate::error::KmtricksError> {
        let mut reader = PartitionReader::open_with_path(inner, path)?;
        let mut hist = Self::new();
        let mut i = 0;
        while let Some(record) = reader.read_record().map_err(|e| crate::error::KmtricksError::io(path, e))? {
            let count = u64::from_le_bytes(record.try_into().expect("Hist record_len is 8"));
            hist.bins[i] = count;
            i += 1;
        }
        Ok(hist)
    }
}

/// Builds a histogram from an iterator of per-k-mer abundances, e.g. the
/// values side of a counter's aggregation map.
#[must_use]
pub fn compute_histogram(counts: impl IntoIterator<Item = u64>) -> Histogram {
    let mut hist = Histogram::new();
    for c in counts {
        hist.record(c);
    }
    hist
}
