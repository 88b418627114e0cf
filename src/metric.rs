//! # Distance Metrics
//!
//! Two notions of closeness are used side by side:
//!
//! - **Prefix distance** over the full 256-bit id ([`distance`]): driven by the
//!   number of matching leading bits, refined by the 23 bits that follow the
//!   first difference. Used to break ties between candidates.
//! - **Ring distance** over the 64-bit ring value ([`select_closest_peer`],
//!   [`select_closest_predecessor`]): the clockwise (successor) or
//!   counter-clockwise (predecessor) gap from a target. This is what decides
//!   finger ownership and request forwarding.

use std::cmp::Ordering;

use crate::identity::{ID_BITS, NodeId};

/// Number of low-order bits filled from the bits after the first mismatch.
const LSB_BITS: u32 = 23;

/// Number of leading bits `a` and `b` share, `0..=256`.
pub fn matching_prefix_bits(a: &NodeId, b: &NodeId) -> u32 {
    let mut bits = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        let diff = x ^ y;
        if diff == 0 {
            bits += 8;
        } else {
            bits += diff.leading_zeros();
            break;
        }
    }
    bits
}

/// Prefix distance: 0 iff identical, larger is farther.
///
/// The high bits hold `256 - matching_prefix_bits`; the low 23 bits record
/// which of the following bits also differ, so among candidates with the same
/// prefix length the one whose next differing bit is lower wins.
pub fn distance(target: &NodeId, candidate: &NodeId) -> u32 {
    let bucket = matching_prefix_bits(target, candidate);
    if bucket == ID_BITS {
        return 0;
    }
    let mut lsb: u32 = 0;
    let end = (bucket + 1 + LSB_BITS).min(ID_BITS);
    for i in (bucket + 1)..end {
        if target.bit(i) != candidate.bit(i) {
            lsb |= 1 << (bucket + LSB_BITS - i);
        }
    }
    let msb = (ID_BITS - bucket) << LSB_BITS;
    msb | lsb
}

/// `u32::MAX - distance`, floored at 1 so it never reads as "identical".
pub fn inverse_distance(target: &NodeId, candidate: &NodeId) -> u32 {
    (u32::MAX - distance(target, candidate)).max(1)
}

/// Which way around the ring closeness is measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Closeness {
    /// First peer at or clockwise after the target.
    Successor,
    /// First peer at or counter-clockwise before the target.
    Predecessor,
}

impl Closeness {
    pub fn from_predecessor_flag(is_predecessor: bool) -> Self {
        if is_predecessor {
            Closeness::Predecessor
        } else {
            Closeness::Successor
        }
    }

    pub fn is_predecessor(self) -> bool {
        self == Closeness::Predecessor
    }
}

/// Gap from `target` to `candidate` walking in the direction of `closeness`.
#[inline]
pub fn ring_gap(target: u64, candidate: u64, closeness: Closeness) -> u64 {
    match closeness {
        Closeness::Successor => candidate.wrapping_sub(target),
        Closeness::Predecessor => target.wrapping_sub(candidate),
    }
}

/// Order two candidates by closeness to `target`; `Less` means `a` is closer.
pub fn compare(target: u64, closeness: Closeness, a: &NodeId, b: &NodeId) -> Ordering {
    let gap_a = ring_gap(target, a.ring_value(), closeness);
    let gap_b = ring_gap(target, b.ring_value(), closeness);
    gap_a.cmp(&gap_b).then_with(|| {
        let anchor = NodeId::from_ring_value(target);
        distance(&anchor, a)
            .cmp(&distance(&anchor, b))
            .then_with(|| a.cmp(b))
    })
}

pub fn select_closest(target: u64, closeness: Closeness, a: &NodeId, b: &NodeId) -> NodeId {
    match compare(target, closeness, a, b) {
        Ordering::Greater => *b,
        _ => *a,
    }
}

/// The candidate reached first walking clockwise from `target`.
pub fn select_closest_peer(target: u64, a: &NodeId, b: &NodeId) -> NodeId {
    select_closest(target, Closeness::Successor, a, b)
}

/// The candidate reached first walking counter-clockwise from `target`.
///
/// Equivalently, `b` wins over `a` iff `b` lies strictly between `a` and the
/// target on the ring.
pub fn select_closest_predecessor(target: u64, a: &NodeId, b: &NodeId) -> NodeId {
    select_closest(target, Closeness::Predecessor, a, b)
}

/// True if `value` lies strictly inside the clockwise arc `(lo, hi)`.
pub fn is_between(value: u64, lo: u64, hi: u64) -> bool {
    let offset = value.wrapping_sub(lo);
    offset != 0 && offset < hi.wrapping_sub(lo)
}
