//! # Bloom Filter Interest Representation
//!
//! Fixed-size probabilistic set over hashed topic tokens. Interest
//! filters summarize what a node (and the mesh behind it) wants to
//! receive; publication filters summarize what a message carries.
//!
//! ## Invariants
//!
//! - `test` never reports absent for an inserted token (no false
//!   negatives). False positives are a sizing tradeoff, not a bug.
//! - Two filters built from the same tokens with the same parameters
//!   are bit-identical.
//! - `union` is bitwise OR over equal-size filters: commutative,
//!   idempotent, and exact (no false positives beyond the inputs').
//!
//! Filter size and hash count are fixed per node configuration and must
//! match across the mesh. A size mismatch is treated as zero overlap
//! (nothing matches) rather than attempting hash remapping; resizing at
//! runtime is not supported.
//!
//! Token positions are derived by double hashing over a BLAKE3 digest,
//! so k probes cost one hash invocation.

use serde::{Deserialize, Serialize};

/// Default filter width in bits.
pub const DEFAULT_FILTER_BITS: usize = 8192;

/// Default number of hash probes per token.
pub const DEFAULT_HASH_COUNT: u8 = 4;

/// Upper bound on accepted filter width (bits).
/// Bounds memory taken by a remotely-supplied interest filter.
pub const MAX_FILTER_BITS: usize = 1 << 20;

/// Filter sizing parameters, fixed per node configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterParams {
    /// Width of the bit array. Rounded up to a whole byte internally.
    pub bits: usize,
    /// Number of probe positions per token.
    pub hashes: u8,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            bits: DEFAULT_FILTER_BITS,
            hashes: DEFAULT_HASH_COUNT,
        }
    }
}

/// Fixed-size Bloom filter over 64-bit topic tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    hashes: u8,
}

impl BloomFilter {
    /// Create an empty filter with the given parameters.
    pub fn new(params: FilterParams) -> Self {
        let bytes = params.bits.div_ceil(8);
        Self {
            bits: vec![0u8; bytes],
            hashes: params.hashes.max(1),
        }
    }

    /// Width of the filter in bits.
    pub fn width(&self) -> usize {
        self.bits.len() * 8
    }

    /// Probe positions for a token: double hashing over a BLAKE3 digest.
    fn positions(&self, token: u64) -> impl Iterator<Item = usize> + '_ {
        let digest = blake3::hash(&token.to_le_bytes());
        let d = digest.as_bytes();
        let h1 = u64::from_le_bytes(d[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(d[8..16].try_into().expect("digest is 32 bytes"))
            | 1; // odd stride so probes cover the array
        let width = self.width() as u64;
        (0..self.hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % width) as usize)
    }

    /// Insert a token.
    pub fn insert(&mut self, token: u64) {
        let positions: Vec<usize> = self.positions(token).collect();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Membership probe. Never false-negative for an inserted token.
    pub fn test(&self, token: u64) -> bool {
        self.positions(token)
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Union of two equal-size filters (bitwise OR).
    ///
    /// A size mismatch contributes nothing: the result is a copy of
    /// `self`. Mismatched meshes degrade to missed aggregation, never
    /// to corrupted filters.
    pub fn union(&self, other: &BloomFilter) -> BloomFilter {
        let mut out = self.clone();
        if other.bits.len() == self.bits.len() {
            for (dst, src) in out.bits.iter_mut().zip(other.bits.iter()) {
                *dst |= *src;
            }
        }
        out
    }

    /// Probabilistic admission test: does any bit of `other` overlap
    /// this filter? Used to decide whether a publication's topic filter
    /// might match a neighbor's aggregate interests. False positives
    /// cause harmless extra forwarding; a size mismatch is zero overlap.
    pub fn intersects(&self, other: &BloomFilter) -> bool {
        if other.bits.len() != self.bits.len() {
            return false;
        }
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// True if no bits are set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Fraction of bits set, for diagnostics and sizing decisions.
    pub fn load(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        set as f64 / self.width() as f64
    }

    /// Wire encoding: hash count byte followed by the bit array.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bits.len());
        out.push(self.hashes);
        out.extend_from_slice(&self.bits);
        out
    }

    /// Decode a wire-encoded filter. Rejects empty or oversized input.
    pub fn from_bytes(bytes: &[u8]) -> Option<BloomFilter> {
        if bytes.len() < 2 || (bytes.len() - 1) * 8 > MAX_FILTER_BITS {
            return None;
        }
        Some(BloomFilter {
            hashes: bytes[0].max(1),
            bits: bytes[1..].to_vec(),
        })
    }
}
