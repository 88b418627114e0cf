//! # Finger Table
//!
//! 65 slots over the 64-bit ring:
//!
//! | Index | Target value | Meaning |
//! |-------|--------------|---------|
//! | 0 | `my + 1` | immediate successor |
//! | 1..=63 | `my + 2^i` | Chord fingers |
//! | 64 | `my - 1` | immediate predecessor |
//!
//! All arithmetic wraps modulo `2^64`. Each slot holds at most one peer and
//! up to `max_trails` redundant trails to it. A trail lists only the
//! intermediates between this node and the finger; an empty trail means the
//! finger is a friend.
//!
//! Offering our own id for a slot is the "nobody better known" sentinel and
//! leaves the slot unchanged.

use tracing::debug;

use crate::error::RouterError;
use crate::identity::NodeId;
use crate::messages::TrailId;
use crate::metric::{self, Closeness};

pub const FINGER_COUNT: usize = 65;
pub const SUCCESSOR_INDEX: usize = 0;
pub const PREDECESSOR_INDEX: usize = 64;

/// Ring value slot `index` is looking for.
pub fn finger_target(my_value: u64, index: usize) -> u64 {
    if index == PREDECESSOR_INDEX {
        my_value.wrapping_sub(1)
    } else {
        my_value.wrapping_add(1u64 << index)
    }
}

/// Inverse of [`finger_target`].
pub fn finger_index(my_value: u64, value: u64) -> Result<usize, RouterError> {
    if value == my_value.wrapping_sub(1) {
        return Ok(PREDECESSOR_INDEX);
    }
    let offset = value.wrapping_sub(my_value);
    if offset.is_power_of_two() {
        return Ok(offset.trailing_zeros() as usize);
    }
    Err(RouterError::InvalidFingerValue(value))
}

pub fn closeness_for(index: usize) -> Closeness {
    if index == PREDECESSOR_INDEX {
        Closeness::Predecessor
    } else {
        Closeness::Successor
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trail {
    pub id: TrailId,
    pub hops: Vec<NodeId>,
}

impl Trail {
    pub fn new(id: TrailId, hops: Vec<NodeId>) -> Self {
        Self { id, hops }
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// The friend a message to `finger` along this trail is handed to.
    pub fn first_hop(&self, finger: &NodeId) -> NodeId {
        self.hops.first().copied().unwrap_or(*finger)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FingerEntry {
    pub identity: NodeId,
    pub index: usize,
    pub trails: Vec<Trail>,
}

impl FingerEntry {
    pub fn shortest_trail(&self) -> Option<&Trail> {
        self.trails.iter().min_by_key(|t| t.len())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FingerUpdate {
    /// New peer installed. `displaced` held the slot before and lost.
    Installed { displaced: Option<FingerEntry> },
    /// Extra trail to the peer already in the slot. `evicted` made room.
    TrailAdded { evicted: Option<Trail> },
    /// Offered trail was not kept and must be torn down.
    Rejected(Trail),
    /// Nothing changed: sentinel offer or a trail already stored.
    Unchanged,
}

#[derive(Debug)]
pub struct FingerTable {
    me: NodeId,
    my_value: u64,
    slots: Vec<Option<FingerEntry>>,
    max_trails: usize,
}

impl FingerTable {
    pub fn new(me: NodeId, max_trails: usize) -> Self {
        Self {
            me,
            my_value: me.ring_value(),
            slots: vec![None; FINGER_COUNT],
            max_trails: max_trails.max(1),
        }
    }

    pub fn target(&self, index: usize) -> u64 {
        finger_target(self.my_value, index)
    }

    pub fn index_for(&self, value: u64) -> Result<usize, RouterError> {
        finger_index(self.my_value, value)
    }

    pub fn get(&self, index: usize) -> Option<&FingerEntry> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn successor(&self) -> Option<&FingerEntry> {
        self.get(SUCCESSOR_INDEX)
    }

    pub fn predecessor(&self) -> Option<&FingerEntry> {
        self.get(PREDECESSOR_INDEX)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FingerEntry> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn installed(&self) -> usize {
        self.iter().count()
    }

    /// Whether [`FingerTable::insert`] would keep `trail` for `identity` in
    /// slot `index`. Leaves the table untouched.
    pub fn accepts(&self, index: usize, identity: &NodeId, trail: &Trail) -> bool {
        if index >= FINGER_COUNT || *identity == self.me {
            return false;
        }
        let Some(existing) = self.get(index) else {
            return true;
        };
        if existing.identity == *identity {
            if existing.trails.iter().any(|t| t.id == trail.id) {
                return false;
            }
            return existing.trails.len() < self.max_trails
                || existing.trails.iter().any(|t| trail.len() < t.len());
        }
        metric::select_closest(self.target(index), closeness_for(index), &existing.identity, identity)
            == *identity
    }

    /// Offer `identity` reached via `trail` for slot `index`.
    pub fn insert(&mut self, index: usize, identity: NodeId, trail: Trail) -> FingerUpdate {
        if index >= FINGER_COUNT || identity == self.me {
            return FingerUpdate::Unchanged;
        }
        let target = self.target(index);
        let closeness = closeness_for(index);
        let max_trails = self.max_trails;
        let slot = &mut self.slots[index];

        let Some(existing) = slot.as_mut() else {
            debug!(index, finger = %identity.short(), hops = trail.len(), "finger installed");
            *slot = Some(FingerEntry {
                identity,
                index,
                trails: vec![trail],
            });
            return FingerUpdate::Installed { displaced: None };
        };

        if existing.identity == identity {
            if existing.trails.iter().any(|t| t.id == trail.id) {
                return FingerUpdate::Unchanged;
            }
            if existing.trails.len() < max_trails {
                existing.trails.push(trail);
                return FingerUpdate::TrailAdded { evicted: None };
            }
            let longest = existing
                .trails
                .iter()
                .enumerate()
                .max_by_key(|(_, t)| t.len())
                .map(|(pos, t)| (pos, t.len()));
            return match longest {
                Some((pos, len)) if trail.len() < len => {
                    let evicted = std::mem::replace(&mut existing.trails[pos], trail);
                    FingerUpdate::TrailAdded {
                        evicted: Some(evicted),
                    }
                }
                _ => FingerUpdate::Rejected(trail),
            };
        }

        let winner = metric::select_closest(target, closeness, &existing.identity, &identity);
        if winner != identity {
            return FingerUpdate::Rejected(trail);
        }
        debug!(
            index,
            old = %existing.identity.short(),
            new = %identity.short(),
            "finger replaced by closer peer"
        );
        let displaced = slot.replace(FingerEntry {
            identity,
            index,
            trails: vec![trail],
        });
        FingerUpdate::Installed { displaced }
    }

    pub fn remove(&mut self, index: usize) -> Option<FingerEntry> {
        self.slots.get_mut(index).and_then(|slot| slot.take())
    }

    /// Locate a stored trail by id.
    pub fn find_trail(&self, trail_id: &TrailId) -> Option<(&FingerEntry, &Trail)> {
        self.iter().find_map(|entry| {
            entry
                .trails
                .iter()
                .find(|t| t.id == *trail_id)
                .map(|t| (entry, t))
        })
    }

    /// Drop one trail; the entry goes with it when it was the last one.
    pub fn remove_trail(&mut self, trail_id: &TrailId) -> Option<(NodeId, Trail)> {
        for slot in self.slots.iter_mut() {
            let Some(entry) = slot.as_mut() else { continue };
            if let Some(pos) = entry.trails.iter().position(|t| t.id == *trail_id) {
                let identity = entry.identity;
                let trail = entry.trails.remove(pos);
                if entry.trails.is_empty() {
                    *slot = None;
                }
                return Some((identity, trail));
            }
        }
        None
    }

    /// Drop every trail whose first hop is `peer`, and the entries left
    /// without a trail. Returns `(finger, trail)` for each trail removed.
    pub fn remove_first_hop(&mut self, peer: &NodeId) -> Vec<(NodeId, Trail)> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(entry) = slot.as_mut() else { continue };
            let identity = entry.identity;
            let (gone, kept): (Vec<Trail>, Vec<Trail>) = std::mem::take(&mut entry.trails)
                .into_iter()
                .partition(|t| t.first_hop(&identity) == *peer);
            entry.trails = kept;
            removed.extend(gone.into_iter().map(|t| (identity, t)));
            if entry.trails.is_empty() {
                *slot = None;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_identity(index: u32) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&index.to_be_bytes());
        NodeId::from_bytes(bytes)
    }

    fn at(value: u64) -> NodeId {
        NodeId::from_ring_value(value)
    }

    fn trail(tag: u8, hops: &[NodeId]) -> Trail {
        Trail::new(TrailId::from_bytes([tag; 32]), hops.to_vec())
    }

    #[test]
    fn finger_targets_follow_chord_rule() {
        let my = 0xDEAD_BEEF_0000_0000u64;
        for i in 0..64 {
            assert_eq!(finger_target(my, i), my.wrapping_add(1u64 << i));
            assert_eq!(finger_index(my, finger_target(my, i)), Ok(i));
        }
        assert_eq!(finger_target(my, PREDECESSOR_INDEX), my - 1);
        assert_eq!(finger_index(my, my - 1), Ok(PREDECESSOR_INDEX));
    }

    #[test]
    fn finger_targets_wrap() {
        let my = u64::MAX - 1;
        assert_eq!(finger_target(my, 2), 2);
        assert_eq!(finger_index(my, 2), Ok(2));
        assert_eq!(finger_target(0, PREDECESSOR_INDEX), u64::MAX);
        assert_eq!(finger_index(0, u64::MAX), Ok(PREDECESSOR_INDEX));
    }

    #[test]
    fn non_finger_values_rejected() {
        let my = 1000;
        for value in [my, my + 3, my + 6, my - 2] {
            assert_eq!(finger_index(my, value), Err(RouterError::InvalidFingerValue(value)));
        }
    }

    #[test]
    fn sentinel_self_leaves_slot_empty() {
        let me = at(100);
        let mut table = FingerTable::new(me, 2);
        assert_eq!(table.insert(0, me, trail(1, &[])), FingerUpdate::Unchanged);
        assert!(table.successor().is_none());
    }

    #[test]
    fn closer_peer_displaces_existing() {
        let me = at(100);
        let mut table = FingerTable::new(me, 2);
        let far = at(500);
        let near = at(150);
        table.insert(0, far, trail(1, &[make_identity(9)]));
        match table.insert(0, near, trail(2, &[])) {
            FingerUpdate::Installed { displaced: Some(old) } => assert_eq!(old.identity, far),
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(table.successor().unwrap().identity, near);

        // A farther peer does not win the slot back.
        assert!(matches!(table.insert(0, far, trail(3, &[])), FingerUpdate::Rejected(_)));
    }

    #[test]
    fn predecessor_slot_prefers_counter_clockwise_closest() {
        let me = at(1000);
        let mut table = FingerTable::new(me, 2);
        table.insert(PREDECESSOR_INDEX, at(200), trail(1, &[]));
        table.insert(PREDECESSOR_INDEX, at(900), trail(2, &[]));
        assert_eq!(table.predecessor().unwrap().identity, at(900));
        table.insert(PREDECESSOR_INDEX, at(1100), trail(3, &[]));
        assert_eq!(table.predecessor().unwrap().identity, at(900));
    }

    #[test]
    fn trail_cap_replaces_longest_with_shorter() {
        let me = at(0);
        let finger = at(10);
        let mut table = FingerTable::new(me, 2);
        let (a, b, c) = (make_identity(1), make_identity(2), make_identity(3));
        table.insert(0, finger, trail(1, &[a, b, c]));
        table.insert(0, finger, trail(2, &[a, b]));
        assert!(matches!(table.insert(0, finger, trail(3, &[a, b, c])), FingerUpdate::Rejected(_)));
        match table.insert(0, finger, trail(4, &[a])) {
            FingerUpdate::TrailAdded { evicted: Some(old) } => assert_eq!(old.len(), 3),
            other => panic!("unexpected update: {other:?}"),
        }
        let entry = table.successor().unwrap();
        assert_eq!(entry.trails.len(), 2);
        assert!(entry.trails.iter().all(|t| t.len() <= 2));
        assert_eq!(entry.shortest_trail().unwrap().len(), 1);
    }

    #[test]
    fn acceptance_check_agrees_with_insert() {
        let me = at(0);
        let finger = at(10);
        let mut table = FingerTable::new(me, 2);
        let (a, b) = (make_identity(1), make_identity(2));
        assert!(table.accepts(0, &finger, &trail(1, &[a, b])));
        assert!(!table.accepts(0, &me, &trail(1, &[])));

        table.insert(0, finger, trail(1, &[a]));
        table.insert(0, finger, trail(2, &[b]));
        assert!(!table.accepts(0, &finger, &trail(3, &[a])));
        assert!(matches!(table.insert(0, finger, trail(3, &[a])), FingerUpdate::Rejected(_)));
        assert!(table.accepts(0, &finger, &trail(4, &[])));
        assert!(!table.accepts(0, &at(20), &trail(5, &[])));
        assert!(table.accepts(0, &at(5), &trail(6, &[a, b])));
        assert_eq!(table.successor().unwrap().trails.len(), 2);
    }

    #[test]
    fn trail_cap_holds_for_any_sequence() {
        let me = at(0);
        let finger = at(10);
        let mut table = FingerTable::new(me, 3);
        let lengths = [5usize, 2, 7, 1, 4, 4, 0, 6, 3, 2];
        for (tag, len) in lengths.iter().enumerate() {
            let hops: Vec<NodeId> = (0..*len as u32).map(|i| make_identity(100 + i)).collect();
            let before: Vec<usize> = table
                .successor()
                .map(|e| e.trails.iter().map(|t| t.len()).collect())
                .unwrap_or_default();
            let update = table.insert(0, finger, trail(tag as u8, &hops));
            let entry = table.successor().unwrap();
            assert!(entry.trails.len() <= 3);
            if let FingerUpdate::TrailAdded { evicted: Some(old) } = update {
                assert!(entry.trails.iter().all(|t| t.len() <= old.len()));
                assert_eq!(old.len(), *before.iter().max().unwrap());
            }
        }
    }

    #[test]
    fn duplicate_trail_id_is_ignored() {
        let me = at(0);
        let mut table = FingerTable::new(me, 2);
        table.insert(0, at(5), trail(1, &[]));
        assert_eq!(table.insert(0, at(5), trail(1, &[])), FingerUpdate::Unchanged);
        assert_eq!(table.successor().unwrap().trails.len(), 1);
    }

    #[test]
    fn first_hop_removal_drops_orphaned_fingers() {
        let me = at(0);
        let mut table = FingerTable::new(me, 2);
        let (p, q) = (make_identity(1), make_identity(2));
        table.insert(0, at(5), trail(1, &[p]));
        table.insert(1, at(9), trail(2, &[p, q]));
        table.insert(1, at(9), trail(3, &[q]));
        table.insert(2, p, trail(4, &[]));

        let removed = table.remove_first_hop(&p);
        assert_eq!(removed.len(), 3);
        assert!(table.get(0).is_none());
        assert!(table.get(2).is_none());
        let survivor = table.get(1).unwrap();
        assert_eq!(survivor.trails.len(), 1);
        assert_eq!(survivor.trails[0].first_hop(&survivor.identity), q);
    }

    #[test]
    fn trail_removal_by_id() {
        let me = at(0);
        let mut table = FingerTable::new(me, 2);
        table.insert(3, at(8), trail(7, &[make_identity(1)]));
        assert!(table.find_trail(&TrailId::from_bytes([7; 32])).is_some());
        let (finger, removed) = table.remove_trail(&TrailId::from_bytes([7; 32])).unwrap();
        assert_eq!(finger, at(8));
        assert_eq!(removed.len(), 1);
        assert!(table.get(3).is_none());
        assert!(table.remove_trail(&TrailId::from_bytes([7; 32])).is_none());
    }
}
