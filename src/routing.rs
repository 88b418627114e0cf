//! # Trail Routing Table
//!
//! Every peer in the middle of a trail keeps exactly one entry for it: the
//! neighbour toward the trail's creator (`prev_hop`) and the neighbour toward
//! its far end (`next_hop`). No hop knows the full path, which is what lets a
//! trail be compressed or torn down one hop at a time.
//!
//! Endpoints never hold an entry for their own trails; they find them through
//! the finger table instead.

use std::collections::HashMap;

use crate::error::RouterError;
use crate::identity::NodeId;
use crate::messages::{Direction, TrailId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingEntry {
    pub prev_hop: NodeId,
    pub next_hop: NodeId,
}

impl RoutingEntry {
    /// The neighbour a message travelling in `direction` goes to next.
    pub fn toward(&self, direction: Direction) -> NodeId {
        match direction {
            Direction::SrcToDest => self.next_hop,
            Direction::DestToSrc => self.prev_hop,
        }
    }

    /// The neighbour a message travelling in `direction` must come from.
    pub fn from_side(&self, direction: Direction) -> NodeId {
        self.toward(direction.reversed())
    }

    pub fn touches(&self, peer: &NodeId) -> bool {
        self.prev_hop == *peer || self.next_hop == *peer
    }
}

#[derive(Debug)]
pub struct TrailRoutingTable {
    entries: HashMap<TrailId, RoutingEntry>,
    threshold: usize,
}

impl TrailRoutingTable {
    pub fn new(threshold: usize) -> Self {
        Self {
            entries: HashMap::new(),
            threshold,
        }
    }

    /// Record this hop's neighbours for `trail_id`. Re-adding the identical
    /// pair is a no-op; a different pair is refused and the original kept.
    /// Returns whether a new entry was created.
    pub fn add(
        &mut self,
        trail_id: TrailId,
        prev_hop: NodeId,
        next_hop: NodeId,
    ) -> Result<bool, RouterError> {
        let entry = RoutingEntry { prev_hop, next_hop };
        match self.entries.get(&trail_id) {
            Some(existing) if *existing == entry => Ok(false),
            Some(_) => Err(RouterError::AlreadyExists(trail_id)),
            None => {
                self.entries.insert(trail_id, entry);
                Ok(true)
            }
        }
    }

    pub fn lookup(&self, trail_id: &TrailId, direction: Direction) -> Option<NodeId> {
        self.entries.get(trail_id).map(|e| e.toward(direction))
    }

    pub fn get(&self, trail_id: &TrailId) -> Option<&RoutingEntry> {
        self.entries.get(trail_id)
    }

    pub fn remove(&mut self, trail_id: &TrailId) -> Option<RoutingEntry> {
        self.entries.remove(trail_id)
    }

    /// Drop every entry that routes through `peer`, returning them so the
    /// caller can notify the surviving side of each trail.
    pub fn remove_all_for_peer(&mut self, peer: &NodeId) -> Vec<(TrailId, RoutingEntry)> {
        let doomed: Vec<TrailId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.touches(peer))
            .map(|(id, _)| *id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Returns the replaced neighbour.
    pub fn update_prev_hop(&mut self, trail_id: &TrailId, new_prev: NodeId) -> Option<NodeId> {
        self.entries
            .get_mut(trail_id)
            .map(|entry| std::mem::replace(&mut entry.prev_hop, new_prev))
    }

    /// Returns the replaced neighbour.
    pub fn update_next_hop(&mut self, trail_id: &TrailId, new_next: NodeId) -> Option<NodeId> {
        self.entries
            .get_mut(trail_id)
            .map(|entry| std::mem::replace(&mut entry.next_hop, new_next))
    }

    /// True once the table holds more entries than its configured cap.
    pub fn is_over_threshold(&self) -> bool {
        self.entries.len() > self.threshold
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TrailId, &RoutingEntry)> {
        self.entries.iter()
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

    fn trail(index: u8) -> TrailId {
        TrailId::from_bytes([index; 32])
    }

    #[test]
    fn identical_add_is_idempotent() {
        let mut table = TrailRoutingTable::new(10);
        let (a, b) = (make_identity(1), make_identity(2));
        assert_eq!(table.add(trail(1), a, b), Ok(true));
        assert_eq!(table.add(trail(1), a, b), Ok(false));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn conflicting_add_keeps_original() {
        let mut table = TrailRoutingTable::new(10);
        let (a, b, c) = (make_identity(1), make_identity(2), make_identity(3));
        table.add(trail(1), a, b).unwrap();
        assert_eq!(table.add(trail(1), a, c), Err(RouterError::AlreadyExists(trail(1))));
        assert_eq!(table.get(&trail(1)), Some(&RoutingEntry { prev_hop: a, next_hop: b }));
    }

    #[test]
    fn lookup_follows_direction() {
        let mut table = TrailRoutingTable::new(10);
        let (a, b) = (make_identity(1), make_identity(2));
        table.add(trail(1), a, b).unwrap();
        assert_eq!(table.lookup(&trail(1), Direction::SrcToDest), Some(b));
        assert_eq!(table.lookup(&trail(1), Direction::DestToSrc), Some(a));
        assert_eq!(table.lookup(&trail(2), Direction::SrcToDest), None);
    }

    #[test]
    fn remove_reports_presence() {
        let mut table = TrailRoutingTable::new(10);
        table.add(trail(1), make_identity(1), make_identity(2)).unwrap();
        assert!(table.remove(&trail(1)).is_some());
        assert!(table.remove(&trail(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn peer_removal_clears_both_sides() {
        let mut table = TrailRoutingTable::new(10);
        let p = make_identity(9);
        table.add(trail(1), p, make_identity(2)).unwrap();
        table.add(trail(2), make_identity(3), p).unwrap();
        table.add(trail(3), make_identity(4), make_identity(5)).unwrap();

        let removed = table.remove_all_for_peer(&p);
        assert_eq!(removed.len(), 2);
        assert!(table.iter().all(|(_, entry)| !entry.touches(&p)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn hop_updates_return_previous_neighbour() {
        let mut table = TrailRoutingTable::new(10);
        let (a, b, c) = (make_identity(1), make_identity(2), make_identity(3));
        table.add(trail(1), a, b).unwrap();
        assert_eq!(table.update_prev_hop(&trail(1), c), Some(a));
        assert_eq!(table.update_next_hop(&trail(1), a), Some(b));
        assert_eq!(table.get(&trail(1)), Some(&RoutingEntry { prev_hop: c, next_hop: a }));
        assert_eq!(table.update_prev_hop(&trail(7), c), None);
    }

    #[test]
    fn threshold_trips_only_when_exceeded() {
        let mut table = TrailRoutingTable::new(2);
        table.add(trail(1), make_identity(1), make_identity(2)).unwrap();
        table.add(trail(2), make_identity(1), make_identity(2)).unwrap();
        assert!(!table.is_over_threshold());
        table.add(trail(3), make_identity(1), make_identity(2)).unwrap();
        assert!(table.is_over_threshold());
    }
}
