//! Minimizer repartition table.
//!
//! The repartitor is the total function `minimizer -> partition` that the
//! binner uses to route every super-k-mer. It is built once, from a
//! bounded sample of the input, by a two-step process: accumulate a rough
//! weight per minimizer bin from the sample, then greedily bin-pack
//! minimizers onto partitions so expected load balances. The resulting
//! table is small (`4^m` entries) and is persisted so a later run can reuse
//! it -- two runs are "mergeable" only if their tables are byte-identical.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::KmtricksError;
use crate::minimizer::{extract_super_kmers, MinimizerOrder};

/// ASCII "KMTRXRP1" as a little-endian `u64`: repartition table header.
const HEADER_MAGIC: u64 = 0x3150_5258_5254_4D4B;
/// Distinct trailing sentinel; two tables are mergeable only if this and
/// everything before it are byte-identical.
const SENTINEL_MAGIC: u64 = 0x454C_4241_5452_4550;

/// How minimizers are ordered when building the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerOrderKind {
    Lexicographic,
    Frequency,
}

/// A complete `minimizer -> partition` assignment, plus the optional
/// frequency-rank table that produced the order used to pick minimizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepartitionTable {
    pub partitions: u32,
    pub m: usize,
    pub pass_count: u32,
    table: Vec<u16>,
    freq: Option<Vec<u32>>,
}

impl RepartitionTable {
    #[must_use]
    pub fn universe_size(&self) -> usize {
        self.table.len()
    }

    /// The partition assigned to an m-mer's packed bits.
    #[must_use]
    pub fn partition_of(&self, minimizer_bits: u64) -> u32 {
        u32::from(self.table[minimizer_bits as usize])
    }

    /// The [`MinimizerOrder`] this table was built with, ready to hand to
    /// [`extract_super_kmers`] / [`crate::minimizer::minimizer_of`].
    #[must_use]
    pub fn minimizer_order(&self) -> MinimizerOrder {
        self.freq.clone().map_or(MinimizerOrder::Lexicographic, MinimizerOrder::Frequency)
    }

    /// Two tables are mergeable iff they are byte-identical, sentinel
    /// included. Since encoding is deterministic, structural equality is
    /// equivalent to byte equality.
    #[must_use]
    pub fn is_mergeable_with(&self, other: &Self) -> bool {
        self == other
    }

    /// Builds the table from a bounded sample of input sequences.
    ///
    /// 1. If `order_kind` is [`MinimizerOrderKind::Frequency`], count m-mer
    ///    occurrences across `sample` and rank them (rank 0 = most frequent;
    ///    m-mers never seen get the largest rank).
    /// 2. Stream `sample` through the super-k-mer iterator, accumulating per
    ///    minimizer a kx-mer weight (`ceil(n_k/4)`) used only for
    ///    bin-packing.
    /// 3. Greedily assign minimizers (heaviest first) to the currently
    ///    lightest partition via a min-heap.
    #[must_use]
    pub fn build<'a>(sample: impl Iterator<Item = &'a [u8]> + Clone, k: usize, m: usize, partitions: u32, order_kind: MinimizerOrderKind) -> Self {
        let universe = 1usize << (2 * m);
        let freq = match order_kind {
            MinimizerOrderKind::Lexicographic => None,
            MinimizerOrderKind::Frequency => Some(rank_by_frequency(sample.clone(), m, universe)),
        };
        let order = freq.clone().map_or(MinimizerOrder::Lexicographic, MinimizerOrder::Frequency);

        let mut weight = vec![0u64; universe];
        for seq in sample {
            for sk in extract_super_kmers(seq, k, m, &order) {
                let kx_mers = u64::from(sk.n_k).div_ceil(4);
                weight[sk.minimizer_bits as usize] += kx_mers;
            }
        }

        let table = greedy_bin_pack(&weight, partitions);
        Self { partitions, m, pass_count: 1, table, freq }
    }

    /// Serializes the table in its on-disk persistence format.
    ///
    /// # Errors
    /// Returns an `io::Error` on write failure.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&HEADER_MAGIC.to_le_bytes())?;
        w.write_all(&self.partitions.to_le_bytes())?;
        #[allow(clippy::cast_possible_truncation)]
        let universe = self.table.len() as u32;
        w.write_all(&universe.to_le_bytes())?;
        w.write_all(&self.pass_count.to_le_bytes())?;
        for &p in &self.table {
            w.write_all(&p.to_le_bytes())?;
        }
        w.write_all(&[u8::from(self.freq.is_some())])?;
        if let Some(freq) = &self.freq {
            for &rank in freq {
                w.write_all(&rank.to_le_bytes())?;
            }
        }
        w.write_all(&SENTINEL_MAGIC.to_le_bytes())?;
        Ok(())
    }

    /// Deserializes a table written by [`Self::write_to`].
    ///
    /// # Errors
    /// Returns an `io::Error` on truncation or a bad header/sentinel magic.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut u64buf = [0u8; 8];
        r.read_exact(&mut u64buf)?;
        if u64::from_le_bytes(u64buf) != HEADER_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad repartition table magic"));
        }
        let mut u32buf = [0u8; 4];
        r.read_exact(&mut u32buf)?;
        let partitions = u32::from_le_bytes(u32buf);
        r.read_exact(&mut u32buf)?;
        let universe = u32::from_le_bytes(u32buf) as usize;
        r.read_exact(&mut u32buf)?;
        let pass_count = u32::from_le_bytes(u32buf);

        let mut table = Vec::with_capacity(universe);
        let mut u16buf = [0u8; 2];
        for _ in 0..universe {
            r.read_exact(&mut u16buf)?;
            table.push(u16::from_le_bytes(u16buf));
        }
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag)?;
        let freq = if flag[0] != 0 {
            let mut freq = Vec::with_capacity(universe);
            for _ in 0..universe {
                r.read_exact(&mut u32buf)?;
                freq.push(u32::from_le_bytes(u32buf));
            }
            Some(freq)
        } else {
            None
        };
        r.read_exact(&mut u64buf)?;
        if u64::from_le_bytes(u64buf) != SENTINEL_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad repartition table sentinel"));
        }

        // m is recovered from the universe size: 4^m == universe.
        let m = (universe.trailing_zeros() / 2) as usize;
        Ok(Self { partitions, m, pass_count, table, freq })
    }

    /// Persists the table at `path`
    /// (`repartition_gatb/repartition.minimRepart`).
    ///
    /// # Errors
    /// Returns [`KmtricksError::Io`] on write failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), KmtricksError> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path).map_err(|e| KmtricksError::io(path, e))?;
        self.write_to(&mut file).map_err(|e| KmtricksError::io(path, e))
    }

    /// Loads a table previously written by [`Self::save`].
    ///
    /// # Errors
    /// Returns [`KmtricksError::Format`] if the file is truncated or
    /// malformed, [`KmtricksError::Io`] otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KmtricksError> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|e| KmtricksError::io(path, e))?;
        Self::read_from(&mut file).map_err(|e| KmtricksError::format(path, e.to_string()))
    }
}

/// Ranks m-mers by descending sample frequency; unseen m-mers get
/// `u32::MAX` so they route to the last partition.
fn rank_by_frequency<'a>(sample: impl Iterator<Item = &'a [u8]>, m: usize, universe: usize) -> Vec<u32> {
    let mut counts = vec![0u64; universe];
    let mask: u64 = if m >= 32 { u64::MAX } else { (1u64 << (2 * m)) - 1 };
    for seq in sample {
        if seq.len() < m {
            continue;
        }
        let mut bits = 0u64;
        for (i, &b) in seq.iter().enumerate() {
            let base = match b {
                b'A' => 0u64,
                b'C' => 1,
                b'G' => 2,
                b'T' => 3,
                _ => {
                    bits = 0;
                    continue;
                }
            };
            bits = ((bits << 2) | base) & mask;
            if i + 1 >= m {
                counts[bits as usize] += 1;
            }
        }
    }

    let mut order: Vec<usize> = (0..universe).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
    let mut ranks = vec![u32::MAX; universe];
    for (rank, mmer) in order.into_iter().enumerate() {
        if counts[mmer] > 0 {
            #[allow(clippy::cast_possible_truncation)]
            {
                ranks[mmer] = rank as u32;
            }
        }
    }
    ranks
}

/// Greedy bin-packing: sort minimizers descending by weight, repeatedly
/// assign the heaviest remaining minimizer to the currently lightest
/// partition.
fn greedy_bin_pack(weight: &[u64], partitions: u32) -> Vec<u16> {
    let mut order: Vec<usize> = (0..weight.len()).collect();
    order.sort_by(|&a, &b| weight[b].cmp(&weight[a]));

    let mut heap: BinaryHeap<Reverse<(u64, u32)>> =
        (0..partitions).map(|p| Reverse((0u64, p))).collect();
    let mut table = vec![0u16; weight.len()];
    for mmer in order {
        let Reverse((load, partition)) = heap.pop().expect("partitions > 0");
        #[allow(clippy::cast_possible_truncation)]
        {
            table[mmer] = partition as u16;
        }
        heap.push(Reverse((load + weight[mmer], partition)));
    }
    table
}
