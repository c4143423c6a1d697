//! Minimizers and super-k-mers.
//!
//! An m-minimizer of a k-mer is the smallest (by some order) of its
//! `k - m + 1` m-mers, excluding any m-mer that contains the 2-mer "AA".
//! Consecutive k-mers in a read that share the same minimizer *occurrence*
//! (same source position and value) form a super-k-mer. This module finds
//! minimizers with a monotonic-deque sliding-window minimum (amortized O(1)
//! per base) and groups k-mers into super-k-mers in one forward pass.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::kmer::{Kmer, PackedKmer};

/// How m-mers are ordered when picking the minimum for a window.
#[derive(Debug, Clone)]
pub enum MinimizerOrder {
    /// Plain lexicographic order over the packed m-mer bits.
    Lexicographic,
    /// Rank table built from a frequency sample: lower rank sorts first.
    /// Indexed by the m-mer's packed bits, length `4^m`.
    Frequency(Vec<u32>),
}

impl MinimizerOrder {
    fn key(&self, bits: u64) -> u64 {
        match self {
            Self::Lexicographic => bits,
            Self::Frequency(ranks) => u64::from(
                ranks
                    .get(bits as usize)
                    .copied()
                    .unwrap_or(u32::MAX),
            ),
        }
    }
}

/// `true` if this m-mer contains the forbidden 2-mer "AA" anywhere, making
/// it an invalid minimizer candidate.
#[must_use]
pub fn contains_aa(bits: u64, m: usize) -> bool {
    if m < 2 {
        return false;
    }
    for i in 0..m - 1 {
        let shift = 2 * (m - 2 - i);
        let pair = (bits >> shift) & 0b1111;
        if pair == 0 {
            // 00 00 == "AA"
            return true;
        }
    }
    false
}

/// A maximal run of consecutive k-mers sharing the same minimizer
/// occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperKmer {
    /// Start position (0-based, in bases) of the super-k-mer within the read.
    pub start: usize,
    /// Number of consecutive k-mers grouped (1..=255).
    pub n_k: u8,
    /// The minimizer's packed m-mer value shared by every k-mer in the run.
    pub minimizer_bits: u64,
    /// The minimizer's start position within the read.
    pub minimizer_start: usize,
    /// Packed nucleotides spanning the whole super-k-mer
    /// (`k + n_k - 1` bases), MSB-first, same packing as [`Kmer::pack`].
    pub packed: Vec<u8>,
}

#[derive(Clone, Copy)]
struct Candidate {
    pos: usize,
    bits: u64,
    valid: bool,
}

impl Candidate {
    // Valid candidates always sort before invalid ones; within the same
    // validity class, order by the configured minimizer order.
    fn sort_key(&self, order: &MinimizerOrder) -> (u8, u64) {
        (u8::from(!self.valid), order.key(self.bits))
    }
}

/// Extracts all super-k-mers from one read.
///
/// K-mers spanning a non-ACGT byte break the current run (the run restarts
/// after the invalid stretch), matching the packing contract in
/// [`Kmer::from_sub`].
#[must_use]
pub fn extract_super_kmers(seq: &[u8], k: usize, m: usize, order: &MinimizerOrder) -> Vec<SuperKmer> {
    assert!(m < k, "minimizer length must be shorter than k");
    let mut out = Vec::new();
    if seq.len() < k {
        return out;
    }

    // Process maximal runs of valid (ACGT) bytes independently; a run
    // shorter than k can't contain a whole k-mer.
    let mut run_start = 0usize;
    while run_start < seq.len() {
        let invalid_at = seq[run_start..]
            .iter()
            .position(|b| !matches!(b, b'A' | b'C' | b'G' | b'T'))
            .map_or(seq.len(), |p| run_start + p);
        let run = &seq[run_start..invalid_at];
        if run.len() >= k {
            extract_super_kmers_in_run(run, run_start, k, m, order, &mut out);
        }
        run_start = invalid_at + 1;
    }
    out
}

fn extract_super_kmers_in_run(
    run: &[u8],
    run_offset: usize,
    k: usize,
    m: usize,
    order: &MinimizerOrder,
    out: &mut Vec<SuperKmer>,
) {
    let mut deque: VecDeque<Candidate> = VecDeque::new();
    let mut mmer_bits: u64 = 0;
    let mmer_mask: u64 = if m >= 32 { u64::MAX } else { (1u64 << (2 * m)) - 1 };

    let mut current_start: Option<usize> = None; // start of open super-k-mer, local to `run`
    let mut current_minimizer: Option<(usize, u64)> = None;
    let mut current_len_k: u32 = 0;

    let push_to_pack = |out_bytes: &mut Vec<u8>, run: &[u8], start: usize, n_bases: usize| {
        let packed = Kmer::from_sub(Bytes::copy_from_slice(&run[start..start + n_bases]))
            .expect("run only contains ACGT bytes")
            .pack();
        // Store as big-endian bytes of the packed value truncated to n_bases*2 bits,
        // left-padded; the bin store only needs a byte-accurate encode/decode pair.
        out_bytes.extend_from_slice(&packed.packed_bits().to_be_bytes());
    };
    let _ = push_to_pack; // silence unused warning when n_k never flushed (can't happen, kept for clarity)

    let mut flush = |out: &mut Vec<SuperKmer>, end_kstart: usize| {
        if let (Some(start), Some((mpos, mbits))) = (current_start, current_minimizer) {
            let n_bases = end_kstart - start + k - 1;
            let packed = pack_run_window(run, start, n_bases);
            out.push(SuperKmer {
                start: run_offset + start,
                n_k: current_len_k as u8,
                minimizer_bits: mbits,
                minimizer_start: run_offset + mpos,
                packed,
            });
        }
    };

    for (kstart, _) in run.windows(k).enumerate() {
        // Admit the new m-mer ending at this k-mer's last position.
        let new_mmer_pos = kstart + k - m;
        mmer_bits = compute_mmer(run, new_mmer_pos, m);
        let valid = !contains_aa(mmer_bits, m);
        let candidate = Candidate {
            pos: new_mmer_pos,
            bits: mmer_bits,
            valid,
        };
        while deque
            .back()
            .is_some_and(|back| back.sort_key(order) >= candidate.sort_key(order))
        {
            deque.pop_back();
        }
        deque.push_back(candidate);

        // Evict candidates that fell out of this k-mer's window [kstart, kstart+k-m].
        while deque.front().is_some_and(|front| front.pos < kstart) {
            deque.pop_front();
        }

        let front = *deque.front().expect("window always has at least one candidate");
        let this_minimizer = (front.pos, front.bits);

        match (current_start, current_minimizer) {
            (Some(_), Some(prev)) if prev == this_minimizer => {
                current_len_k += 1;
                if current_len_k == 255 {
                    flush(out, kstart);
                    current_start = None;
                    current_minimizer = None;
                    current_len_k = 0;
                }
            }
            _ => {
                flush(out, kstart.saturating_sub(1));
                current_start = Some(kstart);
                current_minimizer = Some(this_minimizer);
                current_len_k = 1;
            }
        }
    }
    let last_kstart = run.len() - k;
    flush(out, last_kstart);
}

fn compute_mmer(run: &[u8], start: usize, m: usize) -> u64 {
    let mut bits = 0u64;
    for &b in &run[start..start + m] {
        let base = match b {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            _ => 3,
        };
        bits = (bits << 2) | base;
    }
    bits
}

fn pack_run_window(run: &[u8], start: usize, n_bases: usize) -> Vec<u8> {
    let n_bytes = (n_bases * 2).div_ceil(8);
    let mut bytes = vec![0u8; n_bytes];
    for (i, &b) in run[start..start + n_bases].iter().enumerate() {
        let base = match b {
            b'A' => 0u8,
            b'C' => 1,
            b'G' => 2,
            _ => 3,
        };
        let bit_pos = i * 2;
        let byte_idx = bit_pos / 8;
        let shift = 6 - (bit_pos % 8);
        bytes[byte_idx] |= base << shift;
    }
    bytes
}

/// Inverse of [`pack_run_window`]: expands `n_bases` bases packed 2-bit
/// MSB-first back into ASCII `ACGT` bytes. Used by [`crate::counter`] to
/// recover each k-mer in a super-k-mer's window.
#[must_use]
pub fn unpack_window(packed: &[u8], n_bases: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n_bases);
    for i in 0..n_bases {
        let bit_pos = i * 2;
        let byte_idx = bit_pos / 8;
        let shift = 6 - (bit_pos % 8);
        let base_bits = (packed[byte_idx] >> shift) & 0b11;
        out.push(match base_bits {
            0 => b'A',
            1 => b'C',
            2 => b'G',
            _ => b'T',
        });
    }
    out
}

/// The m-minimizer of a single packed k-mer, scanning all `k - m + 1`
/// windows directly (used for spot checks / testing; the streaming path
/// above is the O(1)-amortized production path).
#[must_use]
pub fn minimizer_of(kmer: &PackedKmer, m: usize, order: &MinimizerOrder) -> u64 {
    let k = kmer.k();
    let bits = kmer.packed_bits();
    let mut best: Option<Candidate> = None;
    for pos in 0..=(k - m) {
        let shift = 2 * (k - m - pos);
        let mmer = (bits >> shift) & if m >= 32 { u64::MAX } else { (1u64 << (2 * m)) - 1 };
        let cand = Candidate {
            pos,
            bits: mmer,
            valid: !contains_aa(mmer, m),
        };
        if best.is_none_or(|b| cand.sort_key(order) < b.sort_key(order)) {
            best = Some(cand);
        }
    }
    best.expect("k >= m guarantees at least one window").bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_aa_detects_adjacent_a() {
        // AA at bases 0,1
        assert!(contains_aa(0b0000_01, 3)); // "AAC"
        assert!(!contains_aa(0b0001_10, 3)); // "CGT" -> no AA
    }

    #[test]
    fn contains_aa_handles_non_adjacent() {
        // "ACA" = 00 01 00, no adjacent AA
        let bits = (0u64 << 4) | (1 << 2) | 0;
        assert!(!contains_aa(bits, 3));
    }

    #[test]
    fn extract_super_kmers_single_run_covers_all_kmers() {
        let seq = b"ACGTACGTAC";
        let k = 5;
        let m = 3;
        let supers = extract_super_kmers(seq, k, m, &MinimizerOrder::Lexicographic);
        let total_kmers: u32 = supers.iter().map(|s| u32::from(s.n_k)).sum();
        assert_eq!(total_kmers as usize, seq.len() - k + 1);
    }

    #[test]
    fn extract_super_kmers_breaks_on_invalid_base() {
        let seq = b"ACGTNACGTAC";
        let k = 4;
        let m = 2;
        let supers = extract_super_kmers(seq, k, m, &MinimizerOrder::Lexicographic);
        // Two separate runs: "ACGT" (exactly k, one k-mer) and "ACGTAC" (3 k-mers)
        let total_kmers: u32 = supers.iter().map(|s| u32::from(s.n_k)).sum();
        assert_eq!(total_kmers, 1 + 3);
    }

    #[test]
    fn super_kmer_n_k_never_exceeds_255() {
        // contrived: a long homopolymer-free run would need real data for n_k>255;
        // just check n_k is always within bounds for any extracted run.
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGT";
        let supers = extract_super_kmers(seq, 5, 3, &MinimizerOrder::Lexicographic);
        for s in &supers {
            assert!(s.n_k >= 1);
        }
    }

    #[test]
    fn unpack_window_inverts_pack_run_window() {
        let run = b"ACGTACGTAC";
        let packed = pack_run_window(run, 2, 6);
        let bases = unpack_window(&packed, 6);
        assert_eq!(bases, run[2..8]);
    }

    #[test]
    fn minimizer_of_matches_brute_force_scan() {
        let kmer = Kmer::from_sub(Bytes::from_static(b"ACGTAC")).unwrap().pack();
        let m = minimizer_of(&kmer, 3, &MinimizerOrder::Lexicographic);
        // Brute force: all 4 windows of length 3 in ACGTAC
        let windows = ["ACG", "CGT", "GTA", "TAC"];
        let expected = windows
            .iter()
            .filter(|w| !w.contains("AA"))
            .min()
            .unwrap();
        let expected_bits = Kmer::from_sub(Bytes::copy_from_slice(expected.as_bytes()))
            .unwrap()
            .pack()
            .packed_bits();
        assert_eq!(m, expected_bits);
    }
}
