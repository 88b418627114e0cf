//! # Successor Verification
//!
//! Periodically each node asks its successor who *its* predecessor is. If
//! that peer sits between us and our successor, it is a better successor:
//! we build a trail to it by chaining our trail to the old successor with
//! the old successor's trail to its predecessor, then announce ourselves
//! with `NotifyNewSuccessor`.
//!
//! The receiving side of both `VerifySuccessor` and `NotifyNewSuccessor`
//! considers the source as a new predecessor; adopting one installs the
//! reverse trail with `AddTrail`.

use tracing::{debug, info, trace};

use crate::error::RouterError;
use crate::fingers::{PREDECESSOR_INDEX, SUCCESSOR_INDEX, Trail};
use crate::friends::Importance;
use crate::identity::NodeId;
use crate::messages::{
    AddTrail, Direction, NotifyNewSuccessor, PeerMessage, TrailId, VerifySuccessor,
    VerifySuccessorResult,
};
use crate::metric;
use crate::router::{Router, shorten_trail};

impl Router {
    /// Timer entry point: ask the current successor for its predecessor.
    pub fn on_verify_successor_tick(&mut self) {
        let Some(entry) = self.fingers.successor() else {
            return;
        };
        let Some(trail) = entry.shortest_trail() else {
            return;
        };
        let successor = entry.identity;
        let (trail_id, hops) = (trail.id, trail.hops.clone());
        trace!(successor = %successor.short(), hops = hops.len(), "verifying successor");
        self.send_along(
            &hops,
            successor,
            PeerMessage::VerifySuccessor(VerifySuccessor {
                source: self.me,
                successor,
                trail_id,
                trail: hops.clone(),
            }),
        );
    }

    pub(crate) fn handle_verify_successor(&mut self, from: NodeId, msg: VerifySuccessor) -> Result<(), RouterError> {
        if msg.successor != self.me {
            let entry = self
                .routing
                .get(&msg.trail_id)
                .copied()
                .ok_or(RouterError::MissingTrail(msg.trail_id))?;
            if from != entry.prev_hop {
                return Err(RouterError::UnexpectedSender { expected: entry.prev_hop, actual: from });
            }
            self.send(entry.next_hop, PeerMessage::VerifySuccessor(msg), Importance::High);
            return Ok(());
        }

        let prev = msg.trail.last().copied().unwrap_or(msg.source);
        if from != prev {
            return Err(RouterError::UnexpectedSender { expected: prev, actual: from });
        }
        self.compare_and_update_predecessor(msg.source, &msg.trail);

        let (probable_successor, trail) = match self.fingers.predecessor() {
            Some(pred) => (
                pred.identity,
                pred.shortest_trail().map(|t| t.hops.clone()).unwrap_or_default(),
            ),
            None => (self.me, Vec::new()),
        };
        // Our predecessor trail may run through the querier; it will splice.
        let trail = if probable_successor == msg.source { Vec::new() } else { trail };
        self.send(
            prev,
            PeerMessage::VerifySuccessorResult(VerifySuccessorResult {
                querying_peer: msg.source,
                current_successor: self.me,
                probable_successor,
                trail_id: msg.trail_id,
                direction: Direction::DestToSrc,
                trail,
            }),
            Importance::High,
        );
        Ok(())
    }

    pub(crate) fn handle_verify_successor_result(
        &mut self,
        from: NodeId,
        msg: VerifySuccessorResult,
    ) -> Result<(), RouterError> {
        if msg.querying_peer != self.me {
            let entry = self
                .routing
                .get(&msg.trail_id)
                .copied()
                .ok_or(RouterError::MissingTrail(msg.trail_id))?;
            let expected = entry.from_side(msg.direction);
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            self.send(entry.toward(msg.direction), PeerMessage::VerifySuccessorResult(msg), Importance::High);
            return Ok(());
        }

        let Some(current) = self.fingers.successor() else {
            trace!("verification result without a successor");
            return Ok(());
        };
        if current.identity != msg.current_successor {
            debug!(
                stale = %msg.current_successor.short(),
                current = %current.identity.short(),
                "verification result from a former successor"
            );
            return Ok(());
        }
        let Some(existing) = current
            .trails
            .iter()
            .find(|t| t.id == msg.trail_id)
            .or_else(|| current.shortest_trail())
            .cloned()
        else {
            return Ok(());
        };
        let expected = existing.hops.first().copied().unwrap_or(msg.current_successor);
        if from != expected {
            return Err(RouterError::UnexpectedSender { expected, actual: from });
        }

        let probable = msg.probable_successor;
        if probable == self.me {
            trace!(successor = %msg.current_successor.short(), "successor agrees on its predecessor");
            return Ok(());
        }

        let target = self.fingers.target(SUCCESSOR_INDEX);
        if probable != msg.current_successor
            && metric::select_closest_peer(target, &msg.current_successor, &probable) == probable
        {
            self.switch_successor(msg.current_successor, &existing, probable, msg.trail);
            return Ok(());
        }

        // Still our successor, but it has someone else as predecessor.
        debug!(
            successor = %msg.current_successor.short(),
            their_predecessor = %probable.short(),
            "notifying successor"
        );
        self.send_along(
            &existing.hops,
            msg.current_successor,
            PeerMessage::NotifyNewSuccessor(NotifyNewSuccessor {
                source: self.me,
                new_successor: msg.current_successor,
                trail_id: existing.id,
                trail: existing.hops.clone(),
            }),
        );
        Ok(())
    }

    /// Replace the successor with `probable`, reached through the old
    /// successor's trail followed by its trail to `probable`.
    fn switch_successor(&mut self, old: NodeId, old_trail: &Trail, probable: NodeId, tail: Vec<NodeId>) {
        let mut hops = old_trail.hops.clone();
        hops.push(old);
        hops.extend(tail);
        let hops = shorten_trail(&self.me, &probable, hops);
        let start = self.compression_start(&probable, &hops);
        let hops = hops[start..].to_vec();

        let trail_id = TrailId::random();
        info!(
            old = %old.short(),
            new = %probable.short(),
            hops = hops.len(),
            "successor's predecessor is closer, switching"
        );
        if self.finger_table_add(SUCCESSOR_INDEX, probable, Trail::new(trail_id, hops.clone())) {
            self.send_along(
                &hops,
                probable,
                PeerMessage::NotifyNewSuccessor(NotifyNewSuccessor {
                    source: self.me,
                    new_successor: probable,
                    trail_id,
                    trail: hops.clone(),
                }),
            );
        }
    }

    pub(crate) fn handle_notify_new_successor(
        &mut self,
        from: NodeId,
        msg: NotifyNewSuccessor,
    ) -> Result<(), RouterError> {
        if msg.new_successor == self.me {
            let expected = msg.trail.last().copied().unwrap_or(msg.source);
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            self.compare_and_update_predecessor(msg.source, &msg.trail);
            return Ok(());
        }

        let pos = msg
            .trail
            .iter()
            .position(|hop| *hop == self.me)
            .ok_or(RouterError::Malformed("notification routed through a peer not on its trail"))?;
        let prev = if pos == 0 { msg.source } else { msg.trail[pos - 1] };
        let next = msg.trail.get(pos + 1).copied().unwrap_or(msg.new_successor);
        if from != prev {
            return Err(RouterError::UnexpectedSender { expected: prev, actual: from });
        }
        self.install_route(msg.trail_id, prev, next)?;
        self.send(next, PeerMessage::NotifyNewSuccessor(msg), Importance::High);
        Ok(())
    }

    /// Adopt `candidate` as predecessor if it lies between the current one
    /// and us. `trail_from_candidate` runs from the candidate to us.
    pub(crate) fn compare_and_update_predecessor(&mut self, candidate: NodeId, trail_from_candidate: &[NodeId]) {
        if candidate == self.me {
            return;
        }
        if let Some(current) = self.fingers.predecessor() {
            if current.identity == candidate {
                return;
            }
            let (lo, hi) = (current.identity.ring_value(), self.me.ring_value());
            if !metric::is_between(candidate.ring_value(), lo, hi) {
                return;
            }
        }

        let reversed: Vec<NodeId> = trail_from_candidate.iter().rev().copied().collect();
        let hops = shorten_trail(&self.me, &candidate, reversed);
        let start = self.compression_start(&candidate, &hops);
        let hops = hops[start..].to_vec();
        let trail_id = TrailId::random();
        info!(predecessor = %candidate.short(), hops = hops.len(), "adopting new predecessor");
        if self.finger_table_add(PREDECESSOR_INDEX, candidate, Trail::new(trail_id, hops.clone()))
            && !hops.is_empty()
        {
            self.send(
                hops[0],
                PeerMessage::AddTrail(AddTrail {
                    source: self.me,
                    destination: candidate,
                    trail_id,
                    trail: hops,
                }),
                Importance::High,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::messages::MessageType;
    use crate::testutil::{Sim, at};

    #[test]
    fn predecessor_adopted_only_when_between() {
        let (me, near, far) = (at(1000), at(900), at(500));
        let mut sim = Sim::new(&[me, near, far], DhtConfig::default());
        sim.link(me, near);
        sim.link(me, far);
        let router = sim.router_mut(me);

        router.compare_and_update_predecessor(far, &[]);
        assert_eq!(router.predecessor(), Some(far));
        router.compare_and_update_predecessor(near, &[]);
        assert_eq!(router.predecessor(), Some(near));
        router.compare_and_update_predecessor(far, &[]);
        assert_eq!(router.predecessor(), Some(near));
        router.compare_and_update_predecessor(me, &[]);
        assert_eq!(router.predecessor(), Some(near));
    }

    #[test]
    fn adopted_predecessor_gets_reverse_trail() {
        // p - m - s line; p notifies s through m.
        let (p, m, s) = (at(100), at(5000), at(200));
        let mut sim = Sim::new(&[p, m, s], DhtConfig::default());
        sim.link(p, m);
        sim.link(m, s);
        sim.router_mut(p).start_finger_search(SUCCESSOR_INDEX);
        sim.run();

        assert_eq!(sim.router(p).successor(), Some(s));
        let pred = sim.router(s).finger(PREDECESSOR_INDEX).unwrap().clone();
        assert_eq!(pred.identity, p);
        assert_eq!(pred.trails[0].hops, vec![m]);
        let reverse = sim.router(m).routing_table().get(&pred.trails[0].id).copied().unwrap();
        assert_eq!((reverse.prev_hop, reverse.next_hop), (s, p));
        assert_eq!(sim.sent(m, p, MessageType::AddTrail), 1);
    }

    #[test]
    fn verification_switches_to_closer_successor() {
        // a - b - c line; a thinks c is its successor, c knows b precedes it.
        let (a, b, c) = (at(100), at(150), at(200));
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        let old = TrailId::from_bytes([1; 32]);
        sim.router_mut(b).install_route(old, a, c).unwrap();
        sim.router_mut(a).finger_table_add(SUCCESSOR_INDEX, c, Trail::new(old, vec![b]));
        sim.router_mut(c).compare_and_update_predecessor(b, &[]);

        sim.router_mut(a).on_verify_successor_tick();
        sim.run();

        let finger = sim.router(a).finger(SUCCESSOR_INDEX).unwrap();
        assert_eq!(finger.identity, b);
        assert!(finger.trails[0].is_empty());
        assert!(sim.router(b).routing_table().get(&old).is_none());
        assert_eq!(sim.sent(b, a, MessageType::VerifySuccessorResult), 1);
        assert_eq!(sim.sent(a, b, MessageType::NotifyNewSuccessor), 1);
        assert_eq!(sim.router(b).predecessor(), Some(a));
    }

    #[test]
    fn verification_lets_successor_adopt_us() {
        let (a, b) = (at(100), at(200));
        let mut sim = Sim::new(&[a, b], DhtConfig::default());
        sim.link(a, b);
        sim.router_mut(a).finger_table_add(SUCCESSOR_INDEX, b, Trail::new(TrailId::from_bytes([1; 32]), vec![]));
        assert_eq!(sim.router(b).predecessor(), None);

        sim.router_mut(a).on_verify_successor_tick();
        sim.run();
        assert_eq!(sim.router(b).predecessor(), Some(a));
        assert_eq!(sim.sent(a, b, MessageType::NotifyNewSuccessor), 0);
    }

    #[test]
    fn result_from_former_successor_is_ignored() {
        let (a, b, c) = (at(100), at(200), at(150));
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.link(a, b);
        sim.link(a, c);
        let trail_id = TrailId::from_bytes([1; 32]);
        sim.router_mut(a).finger_table_add(SUCCESSOR_INDEX, c, Trail::new(trail_id, vec![]));
        sim.deliver(
            b,
            a,
            PeerMessage::VerifySuccessorResult(VerifySuccessorResult {
                querying_peer: a,
                current_successor: b,
                probable_successor: at(120),
                trail_id,
                direction: Direction::DestToSrc,
                trail: vec![],
            }),
        );
        assert_eq!(sim.router(a).successor(), Some(c));
    }
}
