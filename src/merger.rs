//! N-way merge of per-sample counts into one partition's matrices.
//!
//! Each sample contributes one sorted `KmerCount` stream for this
//! partition, the counter's output -- unfiltered by each sample's own
//! abundance threshold, since a count below threshold in isolation may
//! still be worth keeping once the other samples weigh in. [`merge_partition`]
//! performs a priority-queue merge across all of them, producing one row per
//! distinct canonical k-mer with one count per sample (`0` where the
//! sample never saw it), then applies each sample's `abundance_min[i]`
//! and the recurrence/rescue predicate to decide whether the row survives.
//!
//! A count is solid for sample `i` when `c[i] >= abundance_min[i]`.
//! `recurrence` is the number of solid samples. A row is kept if
//! `recurrence >= min_recurrence`. Otherwise, if `save_if` rescue is in
//! effect, every non-solid-but-nonzero count is rescued (counted toward
//! recurrence) as long as it would bring that row up to at least
//! `save_if` solid-or-rescued samples; a row with no rescuable count
//! reaching that bar is dropped.
//!
//! The merged rows are then re-encoded into the five on-disk shapes this
//! pipeline writes: a row-major count matrix and presence/absence matrix
//! keyed by the raw k-mer ([`write_count_matrix`], [`write_pa_matrix`]),
//! their hash-keyed ("packed") equivalents that drop the raw k-mer to save
//! space ([`write_matrix_hash_count`], [`write_pa_matrix_hash`]), and a
//! transposed, per-sample bit vector ([`write_sample_vectors`]).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};

use crate::envelope::{
    CountWidth, FileHeader, MatrixCountHeader, MatrixHashCountHeader, PaMatrixHashHeader, PaMatrixHeader,
    PartitionReader, PartitionWriter, VectorHeader,
};
use crate::error::KmtricksError;
use crate::kmer::PackedKmer;
use crate::matrix::{encode_count_row, BitRow};

/// Counters describing how a merge pass treated borderline rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub rows_kept: u64,
    pub rows_dropped_by_recurrence: u64,
    pub rows_rescued_by_save_if: u64,
}

fn peek_row<R: Read>(reader: &mut PartitionReader<R>, width: CountWidth) -> Result<Option<(u64, u64)>, KmtricksError> {
    let record = reader
        .read_record()
        .map_err(|e| KmtricksError::io("kmer count stream", e))?;
    Ok(record.map(|rec| {
        let bits = u64::from_le_bytes(rec[0..8].try_into().expect("8-byte kmer slot"));
        let count = width.decode(&rec[8..]);
        (bits, count)
    }))
}

/// Merges `readers[i]`'s sorted `KmerCount` stream (one per sample, same
/// partition) into rows of `(canonical_bits, per_sample_counts)`.
///
/// `abundance_min[i]` is the per-sample threshold a count must meet to be
/// solid; `readers`, `abundance_min` are indexed identically. `save_if`,
/// when set, rescues otherwise-sub-threshold counts into a row that would
/// not otherwise meet `min_recurrence`.
///
/// # Errors
/// Returns [`KmtricksError`] on a malformed or truncated stream.
pub fn merge_partition<R: Read>(
    mut readers: Vec<PartitionReader<R>>,
    width: CountWidth,
    abundance_min: &[u32],
    min_recurrence: usize,
    save_if: Option<usize>,
) -> Result<(Vec<(u64, Vec<u64>)>, MergeStats), KmtricksError> {
    let nb_samples = readers.len();
    assert_eq!(abundance_min.len(), nb_samples, "one abundance_min per sample stream");
    let mut fronts: Vec<Option<(u64, u64)>> = readers
        .iter_mut()
        .map(|r| peek_row(r, width))
        .collect::<Result<_, _>>()?;

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    for (i, front) in fronts.iter().enumerate() {
        if let Some((bits, _)) = front {
            heap.push(Reverse((*bits, i)));
        }
    }

    let mut rows = Vec::new();
    let mut stats = MergeStats::default();
    while let Some(&Reverse((min_bits, _))) = heap.peek() {
        let mut counts = vec![0u64; nb_samples];
        while let Some(&Reverse((bits, i))) = heap.peek() {
            if bits != min_bits {
                break;
            }
            heap.pop();
            let (_, count) = fronts[i].take().expect("heap entry matches a live front");
            counts[i] = count;
            if let Some(next) = peek_row(&mut readers[i], width)? {
                fronts[i] = Some(next);
                heap.push(Reverse((next.0, i)));
            }
        }

        let solid = counts.iter().zip(abundance_min).filter(|(&c, &min)| c >= u64::from(min)).count();
        let rescue_triggers = save_if.is_some_and(|save_if| solid + 1 >= save_if);
        if solid >= min_recurrence {
            rows.push((min_bits, counts));
            stats.rows_kept += 1;
        } else if rescue_triggers {
            let rescued = counts.iter().zip(abundance_min).filter(|(&c, &min)| c > 0 && c < u64::from(min)).count();
            if solid + rescued >= min_recurrence {
                rows.push((min_bits, counts));
                stats.rows_kept += 1;
                stats.rows_rescued_by_save_if += 1;
            } else {
                stats.rows_dropped_by_recurrence += 1;
            }
        } else {
            stats.rows_dropped_by_recurrence += 1;
        }
    }
    Ok((rows, stats))
}

/// Writes the row-major count matrix ("count matrix" shape).
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_count_matrix<W: Write>(
    inner: W,
    rows: &[(u64, Vec<u64>)],
    k: u8,
    width: CountWidth,
    nb_samples: u32,
    id: u32,
    partition: u32,
) -> io::Result<W> {
    let header = FileHeader::MatrixCount(MatrixCountHeader {
        k,
        kmer_slots: 1,
        count_slots: u8::try_from(width.bytes()).expect("count width fits in u8"),
        nb_samples,
        id,
        partition,
    });
    let mut writer = PartitionWriter::new(inner, header, false)?;
    for (bits, counts) in rows {
        writer.write_record(&encode_count_row(*bits, counts, width))?;
    }
    writer.finish()
}

/// Writes the row-major presence/absence matrix ("PA matrix" shape).
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_pa_matrix<W: Write>(
    inner: W,
    rows: &[(u64, Vec<u64>)],
    k: u8,
    nb_samples: u32,
    id: u32,
    partition: u32,
) -> io::Result<W> {
    let bytes = (nb_samples as usize).div_ceil(8);
    let header = FileHeader::PaMatrix(PaMatrixHeader {
        k,
        kmer_slots: 1,
        bits: nb_samples,
        bytes: u32::try_from(bytes).expect("byte width fits in u32"),
        id,
        partition,
    });
    let mut writer = PartitionWriter::new(inner, header, false)?;
    for (bits, counts) in rows {
        let mut row = vec![0u8; 8];
        row[..8].copy_from_slice(&bits.to_le_bytes());
        let mut presence = BitRow::zeroed(nb_samples as usize);
        for (i, &c) in counts.iter().enumerate() {
            if c > 0 {
                presence.set(i);
            }
        }
        row.extend_from_slice(presence.bytes());
        writer.write_record(&row)?;
    }
    writer.finish()
}

/// Writes the hash-keyed, per-sample count matrix ("packed-count vector"
/// shape): same data as [`write_count_matrix`] but addressed by the
/// k-mer's hash instead of its raw bits, trading exact recoverability for a
/// smaller on-disk footprint when downstream consumers only need counts.
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_matrix_hash_count<W: Write>(
    inner: W,
    rows: &[(u64, Vec<u64>)],
    k: usize,
    width: CountWidth,
    nb_samples: u32,
    id: u32,
    partition: u32,
) -> io::Result<W> {
    let header = FileHeader::MatrixHashCount(MatrixHashCountHeader {
        count_slots: u8::try_from(width.bytes()).expect("count width fits in u8"),
        nb_samples,
        id,
        partition,
    });
    let mut writer = PartitionWriter::new(inner, header, false)?;
    for (bits, counts) in rows {
        let hash = PackedKmer::from_bits(*bits, k).hash();
        writer.write_record(&encode_count_row(hash, counts, width))?;
    }
    writer.finish()
}

/// Writes the hash-keyed presence/absence matrix ("Bloom vector" shape):
/// like [`write_pa_matrix`] but addressed by hash, so it behaves like a
/// per-k-mer Bloom-filter row rather than an exactly invertible matrix.
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_pa_matrix_hash<W: Write>(
    inner: W,
    rows: &[(u64, Vec<u64>)],
    k: usize,
    nb_samples: u32,
    id: u32,
    partition: u32,
) -> io::Result<W> {
    let bytes = (nb_samples as usize).div_ceil(8);
    let header = FileHeader::PaMatrixHash(PaMatrixHashHeader {
        bits: nb_samples,
        bytes: u32::try_from(bytes).expect("byte width fits in u32"),
        id,
        partition,
    });
    let mut writer = PartitionWriter::new(inner, header, false)?;
    for (bits, counts) in rows {
        let hash = PackedKmer::from_bits(*bits, k).hash();
        let mut row = hash.to_le_bytes().to_vec();
        let mut presence = BitRow::zeroed(nb_samples as usize);
        for (i, &c) in counts.iter().enumerate() {
            if c > 0 {
                presence.set(i);
            }
        }
        row.extend_from_slice(presence.bytes());
        writer.write_record(&row)?;
    }
    writer.finish()
}

/// Writes one `Vector` file per sample: the transpose of the PA matrix
/// ("transposed Bloom" shape). Bit `j` of sample `s`'s vector is set iff
/// `rows[j]`'s count for sample `s` is nonzero. Returns the finished
/// writers, one per sample, in sample order.
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_sample_vectors<W: Write>(
    mut make_writer: impl FnMut(usize) -> io::Result<W>,
    rows: &[(u64, Vec<u64>)],
    nb_samples: usize,
    id: u32,
    partition: u32,
) -> io::Result<Vec<W>> {
    let mut finished = Vec::with_capacity(nb_samples);
    for s in 0..nb_samples {
        let mut vector = BitRow::zeroed(rows.len());
        for (j, (_, counts)) in rows.iter().enumerate() {
            if counts[s] > 0 {
                vector.set(j);
            }
        }
        let header = FileHeader::Vector(VectorHeader {
            bits: u32::try_from(rows.len()).expect("partition row count fits in u32"),
            id,
            partition,
            lower_hash: 0,
            count: vector.popcount(),
        });
        let mut writer = PartitionWriter::new(make_writer(s)?, header, false)?;
        writer.write_record(vector.bytes())?;
        finished.push(writer.finish()?);
    }
    Ok(finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::write_kmer_counts;
    use crate::envelope::PartitionReader;
    use std::path::Path;

    fn sample_stream(rows: &[(u64, u64)]) -> PartitionReader<std::io::Cursor<Vec<u8>>> {
        let bytes = write_kmer_counts(Vec::new(), rows, 21, CountWidth::U8, 0, 0).unwrap();
        PartitionReader::open_with_path(std::io::Cursor::new(bytes), Path::new("s")).unwrap()
    }

    #[test]
    fn merge_unions_kmers_across_samples() {
        let a = sample_stream(&[(1, 5), (3, 2)]);
        let b = sample_stream(&[(2, 7), (3, 1)]);
        let (rows, stats) = merge_partition(vec![a, b], CountWidth::U8, &[1, 1], 1, None).unwrap();
        assert_eq!(rows, vec![(1, vec![5, 0]), (2, vec![0, 7]), (3, vec![2, 1])]);
        assert_eq!(stats.rows_kept, 3);
    }

    #[test]
    fn recurrence_threshold_drops_singleton_rows() {
        let a = sample_stream(&[(1, 5)]);
        let b = sample_stream(&[(2, 7)]);
        let (rows, stats) = merge_partition(vec![a, b], CountWidth::U8, &[1, 1], 2, None).unwrap();
        assert!(rows.is_empty());
        assert_eq!(stats.rows_dropped_by_recurrence, 2);
    }

    #[test]
    fn save_if_two_drops_the_boundary_row() {
        // both samples require abundance_min=2 but only reach 1: neither is
        // solid, so the initial recurrence is 0 and save_if=2 needs 0+1>=2,
        // which fails -- the row is dropped even though save_if is set.
        let a = sample_stream(&[(1, 1)]);
        let b = sample_stream(&[(1, 1)]);
        let (rows, stats) = merge_partition(vec![a, b], CountWidth::U8, &[2, 2], 1, Some(2)).unwrap();
        assert!(rows.is_empty());
        assert_eq!(stats.rows_dropped_by_recurrence, 1);
    }

    #[test]
    fn save_if_one_rescues_the_same_boundary_row() {
        // identical counts to the case above, but save_if=1 means 0+1>=1
        // passes, so both sub-threshold counts are rescued.
        let a = sample_stream(&[(1, 1)]);
        let b = sample_stream(&[(1, 1)]);
        let (rows, stats) = merge_partition(vec![a, b], CountWidth::U8, &[2, 2], 1, Some(1)).unwrap();
        assert_eq!(rows, vec![(1, vec![1, 1])]);
        assert_eq!(stats.rows_rescued_by_save_if, 1);
    }

    #[test]
    fn count_matrix_and_pa_matrix_roundtrip() {
        let rows = vec![(1u64, vec![5u64, 0]), (2, vec![0, 7])];
        let count_bytes = write_count_matrix(Vec::new(), &rows, 21, CountWidth::U8, 2, 0, 0).unwrap();
        let mut r = PartitionReader::open_with_path(count_bytes.as_slice(), Path::new("c")).unwrap();
        let rec = r.read_record().unwrap().unwrap();
        assert_eq!(&rec[0..8], &1u64.to_le_bytes());

        let pa_bytes = write_pa_matrix(Vec::new(), &rows, 21, 2, 0, 0).unwrap();
        let mut r2 = PartitionReader::open_with_path(pa_bytes.as_slice(), Path::new("p")).unwrap();
        let rec2 = r2.read_record().unwrap().unwrap();
        assert_eq!(rec2.len(), 8 + 1); // 1 byte covers 2 samples
    }

    #[test]
    fn sample_vectors_transpose_pa_columns() {
        let rows = vec![(1u64, vec![5u64, 0]), (2, vec![0, 7]), (3, vec![4, 4])];
        let finished = write_sample_vectors(|_| Ok(Vec::new()), &rows, 2, 0, 0).unwrap();

        let mut r0 = PartitionReader::open_with_path(finished[0].as_slice(), Path::new("v0")).unwrap();
        let vec0 = r0.read_record().unwrap().unwrap();
        // sample 0 carries rows 0 and 2 -> bits 0 and 2 set
        assert_eq!(vec0[0] & 0b101, 0b101);
        assert_eq!(vec0[0] & 0b010, 0);

        let mut r1 = PartitionReader::open_with_path(finished[1].as_slice(), Path::new("v1")).unwrap();
        let vec1 = r1.read_record().unwrap().unwrap();
        // sample 1 carries rows 1 and 2 -> bits 1 and 2 set
        assert_eq!(vec1[0] & 0b110, 0b110);
    }
}
