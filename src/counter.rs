//! Per-(sample, partition) k-mer counting.
//!
//! Reads back one sample's super-k-mer bin for a partition, expands every
//! super-k-mer into its constituent k-mers, canonicalizes each, and
//! aggregates counts. Two strategies produce the same sorted
//! `(canonical_bits, count)` sequence:
//!
//! - [`CountStrategy::HashAggregate`]: an `FxHashMap` accumulator, good when
//!   the partition's distinct k-mer count fits comfortably in memory.
//! - [`CountStrategy::Sort`]: collects every canonical k-mer into a flat
//!   `Vec`, sorts it, and run-length-encodes the sorted sequence. Uses more
//!   scratch space up front but no hashing, and is the fallback when a
//!   partition's estimated cardinality is too large for a hash table.
//!
//! The result feeds two places: [`write_kmer_counts`] (the sorted
//! `KmerCount` partition file the merger reads) and
//! [`crate::histogram::compute_histogram`] (built from the *unfiltered*
//! counts, so low-abundance k-mers still show up in the histogram even
//! though [`CountStrategy`] callers usually drop them from the output file).

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::{self, Write};

use bytes::Bytes;
use rustc_hash::FxHasher;

use crate::envelope::{CountWidth, FileHeader, KmerCountHeader, PartitionWriter};
use crate::error::KmtricksError;
use crate::kmer::Kmer;
use crate::minimizer::unpack_window;
use crate::skm_store::SuperKmerBinReader;

type FxMap = HashMap<u64, u64, BuildHasherDefault<FxHasher>>;

/// Which in-memory strategy aggregates canonical k-mer occurrences into
/// counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStrategy {
    HashAggregate,
    Sort,
}

/// Every canonical k-mer seen in one super-k-mer bin, in ascending order of
/// its packed bits, paired with its raw (unsaturated) occurrence count.
///
/// # Errors
/// Returns [`KmtricksError::Format`] if a block decodes to a window shorter
/// than `k`, which can only happen if the bin file was corrupted.
pub fn count_partition(reader: &mut SuperKmerBinReader, k: usize, strategy: CountStrategy) -> Result<Vec<(u64, u64)>, KmtricksError> {
    match strategy {
        CountStrategy::HashAggregate => count_by_hash(reader, k),
        CountStrategy::Sort => count_by_sort(reader, k),
    }
}

fn for_each_canonical_kmer(
    reader: &mut SuperKmerBinReader,
    k: usize,
    mut on_kmer: impl FnMut(u64),
) -> Result<(), KmtricksError> {
    let mut block = Vec::new();
    while reader.read_block(&mut block)? {
        for (n_k, packed) in SuperKmerBinReader::decode_block(&block, k) {
            let n_bases = k + n_k as usize - 1;
            let bases = unpack_window(&packed, n_bases);
            for offset in 0..=n_bases - k {
                let sub = Bytes::copy_from_slice(&bases[offset..offset + k]);
                let canonical = Kmer::from_sub(sub)
                    .map_err(|_| KmtricksError::format("skp bin", "non-ACGT byte inside a packed super-k-mer window"))?
                    .pack()
                    .canonical();
                on_kmer(canonical.packed_bits());
            }
        }
    }
    Ok(())
}

fn count_by_hash(reader: &mut SuperKmerBinReader, k: usize) -> Result<Vec<(u64, u64)>, KmtricksError> {
    let mut map: FxMap = FxMap::default();
    for_each_canonical_kmer(reader, k, |bits| {
        *map.entry(bits).or_insert(0) += 1;
    })?;
    let mut out: Vec<(u64, u64)> = map.into_iter().collect();
    out.sort_unstable_by_key(|&(bits, _)| bits);
    Ok(out)
}

fn count_by_sort(reader: &mut SuperKmerBinReader, k: usize) -> Result<Vec<(u64, u64)>, KmtricksError> {
    let mut all = Vec::new();
    for_each_canonical_kmer(reader, k, |bits| all.push(bits))?;
    all.sort_unstable();

    let mut out = Vec::new();
    let mut iter = all.into_iter().peekable();
    while let Some(bits) = iter.next() {
        let mut count = 1u64;
        while iter.next_if_eq(&bits).is_some() {
            count += 1;
        }
        out.push((bits, count));
    }
    Ok(out)
}

/// Applies an abundance filter (`[min_count, max_count]`) to an
/// already-sorted counts sequence.
#[must_use]
pub fn filter_abundance(counts: &[(u64, u64)], min_count: u64, max_count: Option<u64>) -> Vec<(u64, u64)> {
    counts
        .iter()
        .copied()
        .filter(|&(_, c)| c >= min_count && max_count.is_none_or(|max| c <= max))
        .collect()
}

/// Writes a sorted `(canonical_bits, count)` sequence as a `KmerCount`
/// partition file. Counts are saturated to `width`'s range, never wrapped.
///
/// # Errors
/// Returns an `io::Error` on write failure.
pub fn write_kmer_counts<W: Write>(
    inner: W,
    counts: &[(u64, u64)],
    k: u8,
    width: CountWidth,
    sample_id: u32,
    partition: u32,
) -> io::Result<W> {
    let header = FileHeader::KmerCount(KmerCountHeader {
        k,
        kmer_slots: 1,
        count_slots: u8::try_from(width.bytes()).expect("count width byte counts fit in u8"),
        sample_id,
        partition,
    });
    let mut writer = PartitionWriter::new(inner, header, false)?;
    let mut record = Vec::with_capacity(8 + width.bytes());
    for &(bits, count) in counts {
        record.clear();
        record.extend_from_slice(&bits.to_le_bytes());
        width.encode(width.saturating_add(0, count), &mut record);
        writer.write_record(&record)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skm_store::{PartitionCaches, SuperKmerBinStore};
    use tempfile::tempdir;

    fn seed_store(dir: &std::path::Path, k: usize, seqs: &[&[u8]]) -> SuperKmerBinStore {
        use crate::minimizer::{extract_super_kmers, MinimizerOrder};

        let store = SuperKmerBinStore::create(dir, 1).unwrap();
        {
            let mut caches = PartitionCaches::new(&store, 4096);
            for seq in seqs {
                for sk in extract_super_kmers(seq, k, 3, &MinimizerOrder::Lexicographic) {
                    caches.insert_super_kmer(0, sk.n_k, &sk.packed).unwrap();
                }
            }
            caches.flush_all().unwrap();
        }
        store.finalize().unwrap();
        store
    }

    #[test]
    fn hash_and_sort_strategies_agree() {
        let dir = tempdir().unwrap();
        let k = 5;
        seed_store(dir.path(), k, &[b"ACGTACGTACGTACGTACGT", b"TTTTGGGGCCCCAAAAGGGG"]);

        let mut r1 = SuperKmerBinReader::open(dir.path(), 0).unwrap();
        let hash_result = count_partition(&mut r1, k, CountStrategy::HashAggregate).unwrap();
        let mut r2 = SuperKmerBinReader::open(dir.path(), 0).unwrap();
        let sort_result = count_partition(&mut r2, k, CountStrategy::Sort).unwrap();

        assert_eq!(hash_result, sort_result);
        assert!(!hash_result.is_empty());
        // sorted ascending by packed bits
        assert!(hash_result.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn filter_abundance_drops_below_min_and_above_max() {
        let counts = vec![(1, 1), (2, 5), (3, 10)];
        let filtered = filter_abundance(&counts, 2, Some(8));
        assert_eq!(filtered, vec![(2, 5)]);
    }

    #[test]
    fn write_kmer_counts_roundtrips_through_partition_reader() {
        use crate::envelope::PartitionReader;

        let counts = vec![(10u64, 3u64), (20, 999)];
        let bytes = write_kmer_counts(Vec::new(), &counts, 21, CountWidth::U8, 0, 0).unwrap();
        let mut reader = PartitionReader::open_with_path(bytes.as_slice(), std::path::Path::new("x")).unwrap();
        let r1 = reader.read_record().unwrap().unwrap();
        assert_eq!(&r1[0..8], &10u64.to_le_bytes());
        assert_eq!(r1[8], 3);
        let r2 = reader.read_record().unwrap().unwrap();
        assert_eq!(&r2[0..8], &20u64.to_le_bytes());
        assert_eq!(r2[8], 255); // saturated from 999
    }

    #[test]
    fn total_occurrences_matches_total_kmers_in_input() {
        let dir = tempdir().unwrap();
        let k = 4;
        let seqs: [&[u8]; 1] = [b"ACGTACGTAC"];
        seed_store(dir.path(), k, &seqs);
        let mut reader = SuperKmerBinReader::open(dir.path(), 0).unwrap();
        let counts = count_partition(&mut reader, k, CountStrategy::HashAggregate).unwrap();
        let total: u64 = counts.iter().map(|&(_, c)| c).sum();
        assert_eq!(total as usize, seqs[0].len() - k + 1);
    }
}
