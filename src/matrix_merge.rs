//! Matrix aggregation across independent runs.
//!
//! Two runs can only be combined if they partitioned their k-mer space
//! identically -- [`require_mergeable`] enforces the byte-identical
//! repartition table contract before either combination strategy below
//! runs.
//!
//! - [`concatenate_matrices`]: runs that processed the *same* samples but
//!   different, non-overlapping partitions (e.g. a sharded batch) just get
//!   their records appended in order; no row ever needs combining.
//! - [`merge_count_matrices`] / [`merge_pa_matrices`]: runs that processed
//!   *different* samples for the *same* partition get k-way merged by
//!   k-mer, with each run's columns concatenated into the wider output row
//!   (zero-filled where a run's samples never saw that k-mer).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};

use crate::envelope::{CountWidth, PartitionReader, PartitionWriter};
use crate::error::KmtricksError;
use crate::matrix::{decode_count_row, encode_count_row, BitRow};
use crate::repartition::RepartitionTable;

/// Returns an error unless every table is mergeable with the first
/// (mergeable iff byte-identical, sentinel included).
///
/// # Errors
/// Returns [`KmtricksError::Input`] if any table disagrees with the first.
pub fn require_mergeable(tables: &[RepartitionTable]) -> Result<(), KmtricksError> {
    let Some(first) = tables.first() else { return Ok(()) };
    for (i, table) in tables.iter().enumerate().skip(1) {
        if !first.is_mergeable_with(table) {
            return Err(KmtricksError::input(format!(
                "run 0 and run {i} have incompatible repartition tables; rebuild one from the other's sample before merging"
            )));
        }
    }
    Ok(())
}

/// Appends every record from `readers` onto `writer` in order, for runs
/// over the same samples and disjoint partitions.
///
/// # Errors
/// Returns an `io::Error` on read or write failure.
pub fn concatenate_matrices<R: Read, W: Write>(readers: &mut [PartitionReader<R>], writer: &mut PartitionWriter<W>) -> io::Result<()> {
    for reader in readers {
        while let Some(record) = reader.read_record()? {
            writer.write_record(&record)?;
        }
    }
    Ok(())
}

fn peek_matrix_row<R: Read>(
    reader: &mut PartitionReader<R>,
    nb_samples: usize,
    width: CountWidth,
) -> Result<Option<(u64, Vec<u64>)>, KmtricksError> {
    let record = reader
        .read_record()
        .map_err(|e| KmtricksError::io("matrix stream", e))?;
    Ok(record.map(|rec| decode_count_row(&rec, nb_samples, width)))
}

/// K-way merges count matrices from runs with disjoint sample sets over the
/// same partition, concatenating each run's columns into the combined row.
///
/// # Errors
/// Returns [`KmtricksError`] on a malformed or truncated stream.
pub fn merge_count_matrices<R: Read>(
    mut readers: Vec<PartitionReader<R>>,
    sample_counts: &[usize],
    width: CountWidth,
) -> Result<Vec<(u64, Vec<u64>)>, KmtricksError> {
    let total_samples: usize = sample_counts.iter().sum();
    let offsets: Vec<usize> = sample_counts
        .iter()
        .scan(0, |acc, &n| {
            let start = *acc;
            *acc += n;
            Some(start)
        })
        .collect();

    let mut fronts: Vec<Option<(u64, Vec<u64>)>> = readers
        .iter_mut()
        .zip(sample_counts)
        .map(|(r, &n)| peek_matrix_row(r, n, width))
        .collect::<Result<_, _>>()?;

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    for (i, front) in fronts.iter().enumerate() {
        if let Some((bits, _)) = front {
            heap.push(Reverse((*bits, i)));
        }
    }

    let mut rows = Vec::new();
    while let Some(&Reverse((min_bits, _))) = heap.peek() {
        let mut merged = vec![0u64; total_samples];
        while let Some(&Reverse((bits, i))) = heap.peek() {
            if bits != min_bits {
                break;
            }
            heap.pop();
            let (_, counts) = fronts[i].take().expect("heap entry matches a live front");
            merged[offsets[i]..offsets[i] + sample_counts[i]].copy_from_slice(&counts);
            if let Some(next) = peek_matrix_row(&mut readers[i], sample_counts[i], width)? {
                fronts[i] = Some(next);
                heap.push(Reverse((next.0, i)));
            }
        }
        rows.push((min_bits, merged));
    }
    Ok(rows)
}

/// Writes rows produced by [`merge_count_matrices`] back out as a count
/// matrix record stream (caller supplies the envelope via
/// [`crate::merger::write_count_matrix`]-style helpers upstream).
#[must_use]
pub fn encode_merged_rows(rows: &[(u64, Vec<u64>)], width: CountWidth) -> Vec<Vec<u8>> {
    rows.iter().map(|(bits, counts)| encode_count_row(*bits, counts, width)).collect()
}

fn peek_pa_row<R: Read>(reader: &mut PartitionReader<R>, nb_samples: usize) -> Result<Option<(u64, BitRow)>, KmtricksError> {
    let record = reader
        .read_record()
        .map_err(|e| KmtricksError::io("pa matrix stream", e))?;
    Ok(record.map(|rec| {
        let bits = u64::from_le_bytes(rec[0..8].try_into().expect("8-byte kmer slot"));
        (bits, BitRow::from_bytes(rec[8..].to_vec(), nb_samples))
    }))
}

/// K-way merges presence/absence matrices the same way
/// [`merge_count_matrices`] merges count matrices.
///
/// # Errors
/// Returns [`KmtricksError`] on a malformed or truncated stream.
pub fn merge_pa_matrices<R: Read>(mut readers: Vec<PartitionReader<R>>, sample_counts: &[usize]) -> Result<Vec<(u64, BitRow)>, KmtricksError> {
    let total_samples: usize = sample_counts.iter().sum();
    let offsets: Vec<usize> = sample_counts
        .iter()
        .scan(0, |acc, &n| {
            let start = *acc;
            *acc += n;
            Some(start)
        })
        .collect();

    let mut fronts: Vec<Option<(u64, BitRow)>> = readers
        .iter_mut()
        .zip(sample_counts)
        .map(|(r, &n)| peek_pa_row(r, n))
        .collect::<Result<_, _>>()?;

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    for (i, front) in fronts.iter().enumerate() {
        if let Some((bits, _)) = front {
            heap.push(Reverse((*bits, i)));
        }
    }

    let mut rows = Vec::new();
    while let Some(&Reverse((min_bits, _))) = heap.peek() {
        let mut merged = BitRow::zeroed(total_samples);
        while let Some(&Reverse((bits, i))) = heap.peek() {
            if bits != min_bits {
                break;
            }
            heap.pop();
            let (_, row) = fronts[i].take().expect("heap entry matches a live front");
            for s in 0..sample_counts[i] {
                if row.get(s) {
                    merged.set(offsets[i] + s);
                }
            }
            if let Some(next) = peek_pa_row(&mut readers[i], sample_counts[i])? {
                fronts[i] = Some(next);
                heap.push(Reverse((next.0, i)));
            }
        }
        rows.push((min_bits, merged));
    }
    Ok(rows)
}
