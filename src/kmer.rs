//! K-mer representation and manipulation.
//!
//! A k-mer is stored two ways through its lifecycle: as raw ASCII bytes
//! while it is still being validated, and as a packed 2-bit-per-base `u64`
//! everywhere else (hashing, comparison, on-disk persistence). Packing
//! preserves lexicographic order: `A=00 < C=01 < G=10 < T=11`, and bases are
//! shifted in most-significant-first, so two packed k-mers of the same
//! length compare the same way their byte strings would.
//!
//! `K_MAX` is 32: a k-mer's packed form always fits one 64-bit limb. Wider
//! k only needs more limbs (`kmer_slots = ceil(k/32)` in the on-disk
//! envelope, see [`crate::envelope`]), not a different algorithm; this
//! crate implements the single-limb case.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::error::{InvalidBaseError, KmerLengthError};

/// Compile-time bound on k-mer length: a packed k-mer must fit in one `u64`.
pub const K_MAX: usize = 32;

/// A validated k-mer length in `1..=K_MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KmerLength(usize);

impl KmerLength {
    /// Validates `k` against the compile-time bound.
    ///
    /// # Errors
    ///
    /// Returns [`KmerLengthError`] if `k` is zero or exceeds [`K_MAX`].
    pub fn new(k: usize) -> Result<Self, KmerLengthError> {
        if k == 0 || k > K_MAX {
            return Err(KmerLengthError {
                k,
                min: 1,
                max: K_MAX as u8,
            });
        }
        Ok(Self(k))
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A DNA k-mer in its raw, validated-byte form.
///
/// Produced by [`Kmer::from_sub`]; call [`Kmer::pack`] to obtain the packed
/// representation used by the rest of the pipeline.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Kmer {
    bytes: Bytes,
}

impl Kmer {
    /// Creates a k-mer from a byte window, validating and uppercasing bases.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidBaseError`] at the first byte that is not one of
    /// `A/C/G/T` (case-insensitive).
    pub fn from_sub(sub: Bytes) -> Result<Self, InvalidBaseError> {
        for (position, &byte) in sub.iter().enumerate() {
            if !matches!(byte, b'A' | b'C' | b'G' | b'T' | b'a' | b'c' | b'g' | b't') {
                return Err(InvalidBaseError { base: byte, position });
            }
        }
        let bytes = sub
            .iter()
            .map(u8::to_ascii_uppercase)
            .collect::<Vec<u8>>()
            .into();
        Ok(Self { bytes })
    }

    /// Finds the index of the first byte that is not a valid DNA base.
    ///
    /// Used by the super-k-mer iterator to know where a run is broken.
    #[must_use]
    pub fn find_invalid_byte_index(seq: &[u8]) -> usize {
        seq.iter()
            .position(|b| !matches!(b, b'A' | b'C' | b'G' | b'T'))
            .unwrap_or(seq.len())
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Packs the validated bytes into a [`PackedKmer`].
    #[must_use]
    pub fn pack(&self) -> PackedKmer {
        let mut bits: u64 = 0;
        for &byte in &self.bytes {
            bits = (bits << 2) | base_to_bits(byte);
        }
        PackedKmer {
            bits,
            k: self.bytes.len(),
            which: false,
        }
    }
}

impl FromIterator<u8> for Kmer {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        Self {
            bytes: iter.into_iter().collect(),
        }
    }
}

const fn base_to_bits(byte: u8) -> u64 {
    match byte {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => unreachable!(),
    }
}

const fn bits_to_base(bits: u64) -> u8 {
    match bits & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

/// A k-mer packed into a single `u64`, two bits per base.
///
/// Carries the orientation bit ("which") only transiently, during
/// construction of a super-k-mer; it is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedKmer {
    bits: u64,
    k: usize,
    which: bool,
}

impl PackedKmer {
    /// Builds a packed k-mer directly from bits, without going through
    /// [`Kmer::from_sub`]. Unused high bits must already be zero.
    #[must_use]
    pub const fn from_bits(bits: u64, k: usize) -> Self {
        Self { bits, k, which: false }
    }

    #[must_use]
    pub const fn packed_bits(&self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn k(&self) -> usize {
        self.k
    }

    /// `true` if this packed value is the reverse complement of the
    /// originally-read orientation (set by [`Self::canonical`]).
    #[must_use]
    pub const fn which(&self) -> bool {
        self.which
    }

    /// The reverse complement of this k-mer.
    #[must_use]
    pub fn revcomp(&self) -> Self {
        Self {
            bits: revcomp_bits(self.bits, self.k),
            k: self.k,
            which: !self.which,
        }
    }

    /// Returns the canonical form: the lexicographic minimum of this k-mer
    /// and its reverse complement. Idempotent: canonicalizing twice gives
    /// the same result as canonicalizing once.
    #[must_use]
    pub fn canonical(&self) -> Self {
        let rc = revcomp_bits(self.bits, self.k);
        if rc < self.bits {
            Self {
                bits: rc,
                k: self.k,
                which: true,
            }
        } else {
            Self {
                bits: self.bits,
                k: self.k,
                which: self.which,
            }
        }
    }

    /// Rolls a new base onto the low end, dropping the highest base.
    /// O(1) update used while walking a read forward.
    #[must_use]
    pub fn shift_in(&self, nt: u8) -> Self {
        let mask = mask_for(self.k);
        Self {
            bits: ((self.bits << 2) | base_to_bits(nt)) & mask,
            k: self.k,
            which: false,
        }
    }

    /// Deterministic 64-bit mix, used as the k-mer's hash everywhere one is
    /// needed (hash-based matrix/vector output shapes, hash-count files).
    #[must_use]
    pub fn hash(&self) -> u64 {
        splitmix64(self.bits ^ ((self.k as u64) << 58))
    }

    #[must_use]
    pub fn unpack_to_bytes(&self) -> Bytes {
        unpack_to_bytes(self.bits, KmerLength(self.k))
    }

    #[must_use]
    pub fn unpack_to_string(&self) -> String {
        unpack_to_string(self.bits, KmerLength(self.k))
    }
}

impl Ord for PackedKmer {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.k, other.k, "comparing k-mers of different length");
        self.bits.cmp(&other.bits)
    }
}

impl PartialOrd for PackedKmer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const fn mask_for(k: usize) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k)) - 1
    }
}

fn revcomp_bits(bits: u64, k: usize) -> u64 {
    // Complement every base (A<->T, C<->G is bit-flip of both bits: 00<->11, 01<->10)
    let complemented = !bits & mask_for(k);
    // Reverse the order of 2-bit groups.
    let mut reversed = 0u64;
    let mut rest = complemented;
    for _ in 0..k {
        reversed = (reversed << 2) | (rest & 0b11);
        rest >>= 2;
    }
    reversed
}

/// `splitmix64`: a small, well-distributed integer mixer used as the
/// default hash for packed k-mers and for k in 64-bit chunks when k > 32
/// (the multi-limb case this crate does not otherwise implement).
#[must_use]
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Unpacks a `u64` of packed bases back into bytes, MSB-first.
#[must_use]
pub fn unpack_to_bytes(bits: u64, k: KmerLength) -> Bytes {
    let k = k.get();
    (0..k)
        .map(|i| {
            let shift = 2 * (k - 1 - i);
            bits_to_base((bits >> shift) & 0b11)
        })
        .collect::<Vec<u8>>()
        .into()
}

/// Same as [`unpack_to_bytes`] but returns a `String`.
#[must_use]
pub fn unpack_to_string(bits: u64, k: KmerLength) -> String {
    String::from_utf8(unpack_to_bytes(bits, k).to_vec()).unwrap_or_default()
}
