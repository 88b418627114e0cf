//! # Bloom Filter
//!
//! Fixed-size probabilistic set used in two places:
//!
//! | Use | Elements |
//! |-----|----------|
//! | Peer filter on PUT/GET | ids of peers that already handled the request |
//! | Reply filter on GET | BLAKE3 hashes of results the querier already has |
//!
//! Bit positions come from a BLAKE3 digest of `mutator || element`: the 32
//! digest bytes are read as sixteen big-endian `u16`s, one per hash function.
//! Changing the mutator gives an unrelated false-positive pattern for the same
//! contents, which is what reply filters rely on between retries.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Filter size on the wire.
pub const BLOOM_SIZE_BYTES: usize = 128;

/// Hash functions per element; each consumes two digest bytes.
pub const BLOOM_HASHES: u32 = 16;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    mutator: u32,
    bits: Vec<u8>,
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilter {
    pub fn new() -> Self {
        Self::with_mutator(0)
    }

    pub fn with_mutator(mutator: u32) -> Self {
        Self {
            mutator,
            bits: vec![0u8; BLOOM_SIZE_BYTES],
        }
    }

    pub fn mutator(&self) -> u32 {
        self.mutator
    }

    /// A decoded filter is usable only if it has the fixed wire size.
    pub fn is_well_formed(&self) -> bool {
        self.bits.len() == BLOOM_SIZE_BYTES
    }

    fn positions(&self, element: &[u8]) -> [usize; BLOOM_HASHES as usize] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.mutator.to_be_bytes());
        hasher.update(element);
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        let width = self.bits.len() * 8;
        let mut out = [0usize; BLOOM_HASHES as usize];
        for (i, slot) in out.iter_mut().enumerate() {
            let raw = u16::from_be_bytes([bytes[2 * i], bytes[2 * i + 1]]) as usize;
            *slot = if width == 0 { 0 } else { raw % width };
        }
        out
    }

    pub fn insert(&mut self, element: &[u8]) {
        if self.bits.is_empty() {
            return;
        }
        for pos in self.positions(element) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// May report false positives, never false negatives.
    pub fn test(&self, element: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        self.positions(element)
            .iter()
            .all(|&pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    pub fn insert_peer(&mut self, peer: &NodeId) {
        self.insert(peer.as_bytes());
    }

    pub fn contains_peer(&self, peer: &NodeId) -> bool {
        self.test(peer.as_bytes())
    }

    /// OR `other` into `self`. Returns false, leaving `self` untouched, when
    /// the filters are not compatible.
    pub fn union(&mut self, other: &BloomFilter) -> bool {
        if self.bits.len() != other.bits.len() || self.mutator != other.mutator {
            return false;
        }
        for (mine, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *mine |= theirs;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len());
        out.extend_from_slice(&self.mutator.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 4 + BLOOM_SIZE_BYTES {
            return None;
        }
        let mutator = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Some(Self {
            mutator,
            bits: bytes[4..].to_vec(),
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        f.debug_struct("BloomFilter")
            .field("mutator", &self.mutator)
            .field("bits_set", &set)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::key_for;

    #[test]
    fn inserted_elements_are_found() {
        let mut filter = BloomFilter::new();
        for i in 0..20u32 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0..20u32 {
            assert!(filter.test(&i.to_be_bytes()));
        }
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new();
        assert!(filter.is_empty());
        assert!(!filter.contains_peer(&key_for(b"peer")));
    }

    #[test]
    fn false_positive_rate_is_low_for_small_sets() {
        let mut filter = BloomFilter::new();
        for i in 0..10u32 {
            filter.insert_peer(&key_for(&i.to_be_bytes()));
        }
        let hits = (1000..2000u32)
            .filter(|i| filter.contains_peer(&key_for(&i.to_be_bytes())))
            .count();
        assert!(hits < 10, "too many false positives: {hits}");
    }

    #[test]
    fn union_merges_compatible_filters() {
        let mut a = BloomFilter::with_mutator(3);
        let mut b = BloomFilter::with_mutator(3);
        a.insert(b"left");
        b.insert(b"right");
        assert!(a.union(&b));
        assert!(a.test(b"left"));
        assert!(a.test(b"right"));

        let c = BloomFilter::with_mutator(4);
        let before = a.clone();
        assert!(!a.union(&c));
        assert_eq!(a, before);
    }

    #[test]
    fn mutator_changes_positions() {
        let mut a = BloomFilter::with_mutator(1);
        let mut b = BloomFilter::with_mutator(2);
        a.insert(b"same");
        b.insert(b"same");
        assert_ne!(a.to_bytes()[4..], b.to_bytes()[4..]);
    }

    #[test]
    fn byte_form_preserves_contents() {
        let mut filter = BloomFilter::with_mutator(9);
        filter.insert(b"value");
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(restored, filter);
        assert!(BloomFilter::from_bytes(&[0u8; 10]).is_none());
    }
}
