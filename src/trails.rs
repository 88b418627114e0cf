//! # Trail Construction
//!
//! A trail is a source route to a finger, built hop by hop by a
//! `TrailSetup` that greedily approaches the finger's target value. Only the
//! `TrailSetupResult` travelling back creates routing state, so abandoned
//! searches leave nothing behind.
//!
//! ```text
//!   source ──TrailSetup──▶ A ──▶ B ──▶ finger
//!   source ◀──Result────── A ◀── B ◀── finger     (A, B install routes)
//! ```
//!
//! Overloaded hops answer with `TrailRejected`; the previous hop marks them
//! congested and re-resolves without them. Once installed, a trail can be
//! shortened (`TrailCompression`) when the source is directly connected to a
//! later hop, and is removed hop by hop with `TrailTeardown`.

use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::RouterError;
use crate::fingers::{FINGER_COUNT, PREDECESSOR_INDEX, SUCCESSOR_INDEX, Trail};
use crate::friends::Importance;
use crate::identity::NodeId;
use crate::messages::{
    AddTrail, Direction, MAX_TRAIL_LENGTH, NotifyNewSuccessor, PeerMessage, TrailCompression,
    TrailId, TrailRejected, TrailSetup, TrailSetupResult, TrailTeardown,
};
use crate::metric::Closeness;
use crate::router::{DiscoveryRound, Router};

impl Router {
    /// Timer entry point: start the next discovery round and return how long
    /// to wait before the following one.
    pub fn on_find_finger_tick(&mut self) -> Duration {
        let index = self.next_finger_index();
        self.start_finger_search(index);
        self.next_find_finger_delay()
    }

    fn next_finger_index(&mut self) -> usize {
        if self.fingers.successor().is_none() {
            return SUCCESSOR_INDEX;
        }
        if self.fingers.predecessor().is_none() {
            return PREDECESSOR_INDEX;
        }
        // 63, 62, ..., 1, then 0 and 64 again.
        let index = match self.finger_cursor {
            c if c < PREDECESSOR_INDEX - 1 => PREDECESSOR_INDEX - 1 - c,
            c if c == PREDECESSOR_INDEX - 1 => SUCCESSOR_INDEX,
            _ => PREDECESSOR_INDEX,
        };
        self.finger_cursor = (self.finger_cursor + 1) % FINGER_COUNT;
        index
    }

    fn next_find_finger_delay(&self) -> Duration {
        use rand::Rng;
        let min = self.config.find_peer_min_interval;
        let max = self.config.find_peer_max_interval.max(min);
        rand::thread_rng().gen_range(min..=max)
    }

    /// Send a `TrailSetup` for finger slot `index` through a random
    /// uncongested friend. Returns the new trail id.
    pub fn start_finger_search(&mut self, index: usize) -> Option<TrailId> {
        let now = Instant::now();
        let Some(first_hop) = self.friends.random_uncongested(now, |_| false) else {
            debug!(index, friends = self.friends.len(), "no uncongested friend for finger search");
            return None;
        };
        let trail_id = TrailId::random();
        let target_value = self.fingers.target(index);
        self.rounds.insert(
            trail_id,
            DiscoveryRound {
                index,
                first_hop,
                retried: false,
                deadline: now + self.config.trail_setup_timeout,
            },
        );
        debug!(
            index,
            target = %format!("{target_value:#018x}"),
            via = %first_hop.short(),
            trail = %trail_id.short(),
            "finger search started"
        );
        self.send(
            first_hop,
            PeerMessage::TrailSetup(TrailSetup {
                source: self.me,
                target_value,
                is_predecessor: index == PREDECESSOR_INDEX,
                best_known_destination: first_hop,
                intermediate_trail_id: None,
                trail_id,
                trail: Vec::new(),
            }),
            Importance::High,
        );
        Some(trail_id)
    }

    pub(crate) fn handle_trail_setup(&mut self, from: NodeId, msg: TrailSetup) -> Result<(), RouterError> {
        let TrailSetup {
            source,
            target_value,
            is_predecessor,
            best_known_destination,
            intermediate_trail_id,
            trail_id,
            mut trail,
        } = msg;
        if source == self.me {
            debug!(trail = %trail_id.short(), "own trail setup came back, dropping");
            return Ok(());
        }
        let expected = trail.last().copied().unwrap_or(source);
        if from != expected {
            return Err(RouterError::UnexpectedSender { expected, actual: from });
        }

        if self.routing.is_over_threshold() {
            debug!(
                trail = %trail_id.short(),
                entries = self.routing.len(),
                "routing table over threshold, rejecting trail"
            );
            self.send(
                from,
                PeerMessage::TrailRejected(TrailRejected {
                    source,
                    target_value,
                    is_predecessor,
                    trail_id,
                    congestion_time_ms: u64::try_from(self.config.congestion_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    trail,
                }),
                Importance::High,
            );
            return Ok(());
        }

        // The setup looped back to us: cut the loop and avoid its members.
        let mut looped = Vec::new();
        if let Some(pos) = trail.iter().position(|hop| *hop == self.me) {
            looped = trail.split_off(pos);
            looped.remove(0);
            debug!(trail = %trail_id.short(), loop_len = looped.len(), "trail setup intersected itself");
        }

        let closeness = Closeness::from_predecessor_flag(is_predecessor);
        let carried = (best_known_destination != self.me)
            .then_some((best_known_destination, intermediate_trail_id));
        let skip = |peer: &NodeId| *peer == source || trail.contains(peer) || looped.contains(peer);
        let hop = self.find_best_destination(target_value, closeness, carried, &skip, true);

        if hop.destination == self.me {
            let prev = trail.last().copied().unwrap_or(source);
            trace!(trail = %trail_id.short(), source = %source.short(), "trail setup ends here");
            self.send(
                prev,
                PeerMessage::TrailSetupResult(TrailSetupResult {
                    querying_peer: source,
                    finger_identity: self.me,
                    target_value,
                    is_predecessor,
                    trail_id,
                    trail,
                }),
                Importance::High,
            );
            return Ok(());
        }

        trail.push(self.me);
        if trail.len() > MAX_TRAIL_LENGTH {
            return Err(RouterError::Malformed("trail setup exceeded maximum trail length"));
        }
        self.send(
            hop.next_hop,
            PeerMessage::TrailSetup(TrailSetup {
                source,
                target_value,
                is_predecessor,
                best_known_destination: hop.destination,
                intermediate_trail_id: hop.trail_id,
                trail_id,
                trail,
            }),
            Importance::High,
        );
        Ok(())
    }

    pub(crate) fn handle_trail_setup_result(
        &mut self,
        from: NodeId,
        msg: TrailSetupResult,
    ) -> Result<(), RouterError> {
        if msg.querying_peer == self.me {
            let expected = msg.trail.last().copied().unwrap_or(msg.finger_identity);
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            let index = self.fingers.index_for(msg.target_value)?;
            if (index == PREDECESSOR_INDEX) != msg.is_predecessor {
                return Err(RouterError::Malformed("predecessor flag disagrees with target value"));
            }
            self.rounds.remove(&msg.trail_id);
            self.install_finger_trail(index, msg.finger_identity, msg.trail_id, msg.trail);
            return Ok(());
        }

        let pos = msg
            .trail
            .iter()
            .position(|hop| *hop == self.me)
            .ok_or(RouterError::Malformed("result routed through a peer not on its trail"))?;
        let next = msg.trail.get(pos + 1).copied().unwrap_or(msg.finger_identity);
        let prev = if pos == 0 {
            msg.querying_peer
        } else {
            msg.trail[pos - 1]
        };
        if from != next {
            return Err(RouterError::UnexpectedSender { expected: next, actual: from });
        }
        self.install_route(msg.trail_id, prev, next)?;
        self.send(prev, PeerMessage::TrailSetupResult(msg), Importance::High);
        Ok(())
    }

    /// Compress a freshly built trail, offer it to the finger table and,
    /// for a new successor, let it know about us.
    fn install_finger_trail(&mut self, index: usize, finger: NodeId, trail_id: TrailId, hops: Vec<NodeId>) {
        if finger == self.me {
            trace!(index, "search found no peer closer than ourselves");
            return;
        }
        let start = self.compression_start(&finger, &hops);
        let compressed = start > 0;
        let candidate = Trail::new(trail_id, hops[start..].to_vec());
        if compressed && !self.fingers.accepts(index, &finger, &candidate) {
            // Nobody re-pointed yet: the trail still runs through hops[0].
            debug!(index, trail = %trail_id.short(), "new trail not kept, tearing it down");
            self.send_teardown(hops[0], trail_id, Direction::SrcToDest);
            return;
        }
        if compressed {
            let new_first_friend = hops.get(start).copied().unwrap_or(finger);
            debug!(
                trail = %trail_id.short(),
                from_len = hops.len(),
                to_len = candidate.len(),
                "compressing new trail"
            );
            self.send(
                hops[0],
                PeerMessage::TrailCompression(TrailCompression {
                    source: self.me,
                    new_first_friend,
                    trail_id,
                }),
                Importance::High,
            );
        }
        let kept_hops = candidate.hops.clone();

        let old_successor = self.successor();
        let kept = self.finger_table_add(index, finger, candidate);
        // A compressed trail is re-pointed by the TrailCompression still in
        // flight; the next verification round will notify instead.
        if kept && index == SUCCESSOR_INDEX && old_successor != Some(finger) && !compressed {
            self.send_along(
                &kept_hops,
                finger,
                PeerMessage::NotifyNewSuccessor(NotifyNewSuccessor {
                    source: self.me,
                    new_successor: finger,
                    trail_id,
                    trail: kept_hops.clone(),
                }),
            );
        }
    }

    /// Send `msg` to the first hop of a trail toward `destination`.
    pub(crate) fn send_along(&mut self, hops: &[NodeId], destination: NodeId, msg: PeerMessage) {
        let first = hops.first().copied().unwrap_or(destination);
        self.send(first, msg, Importance::High);
    }

    pub(crate) fn handle_trail_rejected(&mut self, from: NodeId, msg: TrailRejected) -> Result<(), RouterError> {
        let closeness = Closeness::from_predecessor_flag(msg.is_predecessor);
        if msg.source == self.me {
            if !msg.trail.is_empty() {
                return Err(RouterError::Malformed("rejection for own setup carries a trail"));
            }
        } else if msg.trail.last() != Some(&self.me) {
            return Err(RouterError::Malformed("rejection delivered to a peer that did not forward"));
        }
        let cooldown = Duration::from_millis(msg.congestion_time_ms).min(self.config.congestion_timeout);
        self.friends.mark_congested(&from, cooldown);
        self.stats.trails_rejected += 1;

        if msg.source == self.me {
            let Some(round) = self.rounds.get_mut(&msg.trail_id) else {
                trace!(trail = %msg.trail_id.short(), "rejection for unknown round");
                return Ok(());
            };
            if round.retried {
                let index = round.index;
                self.rounds.remove(&msg.trail_id);
                info!(index, trail = %msg.trail_id.short(), "finger search abandoned after second rejection");
                return Ok(());
            }
            round.retried = true;
            let Some(first_hop) = self.friends.random_uncongested(Instant::now(), |p| *p == from) else {
                self.rounds.remove(&msg.trail_id);
                debug!(trail = %msg.trail_id.short(), "no other friend to retry finger search");
                return Ok(());
            };
            if let Some(round) = self.rounds.get_mut(&msg.trail_id) {
                round.first_hop = first_hop;
            }
            debug!(trail = %msg.trail_id.short(), via = %first_hop.short(), "retrying finger search");
            self.send(
                first_hop,
                PeerMessage::TrailSetup(TrailSetup {
                    source: self.me,
                    target_value: msg.target_value,
                    is_predecessor: msg.is_predecessor,
                    best_known_destination: first_hop,
                    intermediate_trail_id: None,
                    trail_id: msg.trail_id,
                    trail: Vec::new(),
                }),
                Importance::High,
            );
            return Ok(());
        }

        let TrailRejected {
            source,
            target_value,
            is_predecessor,
            trail_id,
            mut trail,
            ..
        } = msg;
        trail.pop();
        let skip = |peer: &NodeId| *peer == source || *peer == from || trail.contains(peer);
        let hop = self.find_best_destination(target_value, closeness, None, &skip, true);
        if hop.destination == self.me {
            let prev = trail.last().copied().unwrap_or(source);
            debug!(trail = %trail_id.short(), "backtracked trail setup ends here");
            self.send(
                prev,
                PeerMessage::TrailSetupResult(TrailSetupResult {
                    querying_peer: source,
                    finger_identity: self.me,
                    target_value,
                    is_predecessor,
                    trail_id,
                    trail,
                }),
                Importance::High,
            );
        } else {
            trail.push(self.me);
            self.send(
                hop.next_hop,
                PeerMessage::TrailSetup(TrailSetup {
                    source,
                    target_value,
                    is_predecessor,
                    best_known_destination: hop.destination,
                    intermediate_trail_id: hop.trail_id,
                    trail_id,
                    trail,
                }),
                Importance::High,
            );
        }
        Ok(())
    }

    pub(crate) fn handle_trail_teardown(&mut self, from: NodeId, msg: TrailTeardown) -> Result<(), RouterError> {
        if let Some(entry) = self.routing.get(&msg.trail_id).copied() {
            let expected = entry.from_side(msg.direction);
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            self.drop_route(&msg.trail_id);
            trace!(trail = %msg.trail_id.short(), direction = ?msg.direction, "route torn down");
            self.send(
                entry.toward(msg.direction),
                PeerMessage::TrailTeardown(msg),
                Importance::High,
            );
            return Ok(());
        }

        // No routing entry: we are an endpoint. Only the source keeps state.
        if msg.direction == Direction::DestToSrc
            && let Some((finger, trail)) = self.fingers.find_trail(&msg.trail_id)
        {
            let first_hop = trail.first_hop(&finger.identity);
            if from != first_hop {
                return Err(RouterError::UnexpectedSender { expected: first_hop, actual: from });
            }
            if let Some((finger, trail)) = self.fingers.remove_trail(&msg.trail_id) {
                self.friends.release_trail(&trail.first_hop(&finger));
                debug!(finger = %finger.short(), trail = %msg.trail_id.short(), "finger trail torn down");
            }
        }
        Ok(())
    }

    pub(crate) fn handle_trail_compression(
        &mut self,
        from: NodeId,
        msg: TrailCompression,
    ) -> Result<(), RouterError> {
        if msg.new_first_friend == self.me {
            if let Some(entry) = self.routing.get(&msg.trail_id).copied() {
                if from != entry.prev_hop {
                    return Err(RouterError::UnexpectedSender { expected: entry.prev_hop, actual: from });
                }
                self.retarget_prev_hop(&msg.trail_id, msg.source);
                trace!(trail = %msg.trail_id.short(), source = %msg.source.short(), "now first hop of compressed trail");
            }
            return Ok(());
        }

        let entry = self
            .routing
            .get(&msg.trail_id)
            .copied()
            .ok_or(RouterError::MissingTrail(msg.trail_id))?;
        if from != entry.prev_hop {
            return Err(RouterError::UnexpectedSender { expected: entry.prev_hop, actual: from });
        }
        self.drop_route(&msg.trail_id);
        self.send(entry.next_hop, PeerMessage::TrailCompression(msg), Importance::High);
        Ok(())
    }

    pub(crate) fn handle_add_trail(&mut self, from: NodeId, msg: AddTrail) -> Result<(), RouterError> {
        if msg.destination == self.me {
            let expected = msg.trail.last().copied().unwrap_or(msg.source);
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            trace!(trail = %msg.trail_id.short(), source = %msg.source.short(), "trail added toward us");
            return Ok(());
        }
        let pos = msg
            .trail
            .iter()
            .position(|hop| *hop == self.me)
            .ok_or(RouterError::Malformed("add-trail routed through a peer not on its trail"))?;
        let prev = if pos == 0 { msg.source } else { msg.trail[pos - 1] };
        let next = msg.trail.get(pos + 1).copied().unwrap_or(msg.destination);
        if from != prev {
            return Err(RouterError::UnexpectedSender { expected: prev, actual: from });
        }
        self.install_route(msg.trail_id, prev, next)?;
        self.send(next, PeerMessage::AddTrail(msg), Importance::High);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::messages::MessageType;
    use crate::testutil::{Sim, at};

    #[test]
    fn direct_friend_becomes_successor() {
        let (a, b) = (at(100), at(200));
        let mut sim = Sim::new(&[a, b], DhtConfig::default());
        sim.link(a, b);
        sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX);
        sim.run();

        let finger = sim.router(a).finger(SUCCESSOR_INDEX).unwrap();
        assert_eq!(finger.identity, b);
        assert_eq!(finger.trails.len(), 1);
        assert!(finger.trails[0].is_empty());
        assert!(sim.router(b).routing_table().is_empty());
    }

    #[test]
    fn setup_result_installs_routes_on_intermediates() {
        // a - b - c on a line; c is a's successor.
        let (a, b, c) = (at(100), at(900), at(150));
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        let trail_id = sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX).unwrap();
        sim.run();

        let finger = sim.router(a).finger(SUCCESSOR_INDEX).unwrap();
        assert_eq!(finger.identity, c);
        assert_eq!(finger.trails[0].hops, vec![b]);
        let entry = sim.router(b).routing_table().get(&trail_id).copied().unwrap();
        assert_eq!((entry.prev_hop, entry.next_hop), (a, c));
        assert!(sim.router(a).rounds.is_empty());
    }

    #[test]
    fn congested_hop_is_rejected_and_bypassed() {
        let (a, b, c) = (at(100), at(300), at(200));
        let config = DhtConfig {
            routing_table_threshold: 0,
            ..DhtConfig::default()
        };
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.replace_router(c, config);
        sim.link(a, b);
        sim.link(b, c);
        // Push c over its threshold with an unrelated route.
        sim.router_mut(c).install_route(TrailId::from_bytes([7; 32]), b, b).unwrap();

        sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX);
        sim.run();

        assert!(sim.sent(c, b, MessageType::TrailRejected) >= 1);
        assert_eq!(sim.router(a).successor(), Some(b));
        assert!(sim.router(b).friends.is_congested(&c, Instant::now()));

        // Within the cooldown b no longer offers c as a next hop.
        let before = sim.sent(b, c, MessageType::TrailSetup);
        sim.router_mut(a).start_finger_search(1);
        sim.run();
        assert_eq!(sim.sent(b, c, MessageType::TrailSetup), before);
    }

    #[test]
    fn rejection_at_first_hop_retries_once() {
        let (a, b, c) = (at(100), at(300), at(400));
        let congested = DhtConfig {
            routing_table_threshold: 0,
            ..DhtConfig::default()
        };
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.replace_router(b, congested.clone());
        sim.replace_router(c, congested);
        sim.link(a, b);
        sim.link(a, c);
        let filler = TrailId::from_bytes([9; 32]);
        sim.router_mut(b).install_route(filler, a, a).unwrap();
        sim.router_mut(c).install_route(filler, a, a).unwrap();

        let trail_id = sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX).unwrap();
        sim.run();

        assert_eq!(sim.sent(a, b, MessageType::TrailSetup) + sim.sent(a, c, MessageType::TrailSetup), 2);
        assert!(!sim.router(a).rounds.contains_key(&trail_id));
        assert_eq!(sim.router(a).successor(), None);
    }

    #[test]
    fn closer_finger_displaces_and_tears_down_old_trail() {
        let (a, f, x, y) = (at(100), at(5000), at(500), at(150));
        let mut sim = Sim::new(&[a, f, x, y], DhtConfig::default());
        sim.link(a, f);
        sim.link(f, x);
        sim.link(f, y);

        // a already reaches x through f.
        let old = TrailId::from_bytes([1; 32]);
        sim.router_mut(f).install_route(old, a, x).unwrap();
        sim.router_mut(a).finger_table_add(SUCCESSOR_INDEX, x, Trail::new(old, vec![f]));

        sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX);
        sim.run();

        assert_eq!(sim.router(a).successor(), Some(y));
        assert!(sim.sent(a, f, MessageType::TrailTeardown) >= 1);
        assert!(sim.router(f).routing_table().get(&old).is_none());
        // y learned about a and adopted it as predecessor.
        assert_eq!(sim.router(y).predecessor(), Some(a));
    }

    #[test]
    fn trail_is_compressed_to_last_friend() {
        // a - b - c - d line, plus a direct a - c link added after setup.
        let (a, b, c, d) = (at(100), at(9000), at(8000), at(120));
        let mut sim = Sim::new(&[a, b, c, d], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        sim.link(c, d);
        let trail_id = TrailId::from_bytes([4; 32]);
        sim.router_mut(b).install_route(trail_id, a, c).unwrap();
        sim.router_mut(c).install_route(trail_id, b, d).unwrap();
        sim.link(a, c);

        sim.router_mut(a).install_finger_trail(SUCCESSOR_INDEX, d, trail_id, vec![b, c]);
        sim.run();

        let finger = sim.router(a).finger(SUCCESSOR_INDEX).unwrap();
        assert_eq!(finger.trails[0].hops, vec![c]);
        assert!(sim.router(b).routing_table().get(&trail_id).is_none());
        let entry = sim.router(c).routing_table().get(&trail_id).copied().unwrap();
        assert_eq!((entry.prev_hop, entry.next_hop), (a, d));
    }

    #[test]
    fn unwanted_compressible_trail_is_torn_down_whole() {
        // Same line as above, but a already reaches d over two one-hop trails.
        let (a, b, c, d) = (at(100), at(9000), at(8000), at(120));
        let mut sim = Sim::new(&[a, b, c, d], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        sim.link(c, d);
        sim.link(a, c);
        for tag in [5u8, 6] {
            let short = TrailId::from_bytes([tag; 32]);
            sim.router_mut(c).install_route(short, a, d).unwrap();
            sim.router_mut(a).finger_table_add(SUCCESSOR_INDEX, d, Trail::new(short, vec![c]));
        }
        let trail_id = TrailId::from_bytes([4; 32]);
        sim.router_mut(b).install_route(trail_id, a, c).unwrap();
        sim.router_mut(c).install_route(trail_id, b, d).unwrap();

        sim.router_mut(a).install_finger_trail(SUCCESSOR_INDEX, d, trail_id, vec![b, c]);
        sim.run();

        assert_eq!(sim.sent(a, b, MessageType::TrailCompression), 0);
        assert_eq!(sim.sent(a, b, MessageType::TrailTeardown), 1);
        let finger = sim.router(a).finger(SUCCESSOR_INDEX).unwrap();
        assert!(finger.trails.iter().all(|t| t.id != trail_id));
        assert!(sim.router(b).routing_table().get(&trail_id).is_none());
        assert!(sim.router(c).routing_table().get(&trail_id).is_none());
        assert_eq!(sim.router(c).routing_table().len(), 2);
    }

    #[test]
    fn malformed_rejection_leaves_sender_uncongested() {
        let (a, b, x) = (at(100), at(200), at(300));
        let mut sim = Sim::new(&[a, b, x], DhtConfig::default());
        sim.link(a, b);
        let rejection = |source, trail| {
            PeerMessage::TrailRejected(TrailRejected {
                source,
                target_value: 101,
                is_predecessor: false,
                trail_id: TrailId::from_bytes([8; 32]),
                congestion_time_ms: 1_000,
                trail,
            })
        };
        // Our own setup never carries a trail back.
        sim.deliver(b, a, rejection(a, vec![x]));
        // Someone else's setup that we did not forward.
        sim.deliver(b, a, rejection(x, vec![b]));

        let router = sim.router(a);
        assert_eq!(router.stats().malformed_dropped, 2);
        assert_eq!(router.stats().trails_rejected, 0);
        assert!(!router.friends.is_congested(&b, Instant::now()));
    }

    #[test]
    fn teardown_from_wrong_neighbour_is_ignored() {
        let (a, b, c, z) = (at(1), at(2), at(3), at(4));
        let mut sim = Sim::new(&[a, b, c, z], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        sim.link(b, z);
        let trail_id = TrailId::from_bytes([5; 32]);
        sim.router_mut(b).install_route(trail_id, a, c).unwrap();
        sim.deliver(
            z,
            b,
            PeerMessage::TrailTeardown(TrailTeardown { trail_id, direction: Direction::SrcToDest }),
        );
        assert!(sim.router(b).routing_table().get(&trail_id).is_some());

        sim.deliver(
            a,
            b,
            PeerMessage::TrailTeardown(TrailTeardown { trail_id, direction: Direction::SrcToDest }),
        );
        sim.run();
        assert!(sim.router(b).routing_table().get(&trail_id).is_none());
        assert_eq!(sim.sent(b, c, MessageType::TrailTeardown), 1);
    }

    #[test]
    fn disconnect_cleans_up_along_trail() {
        let (a, b, c) = (at(100), at(900), at(150));
        let mut sim = Sim::new(&[a, b, c], DhtConfig::default());
        sim.link(a, b);
        sim.link(b, c);
        let trail_id = sim.router_mut(a).start_finger_search(SUCCESSOR_INDEX).unwrap();
        sim.run();
        assert_eq!(sim.router(a).successor(), Some(c));

        sim.unlink(a, b);
        sim.run();
        assert_eq!(sim.router(a).successor(), None);
        assert!(sim.router(b).routing_table().get(&trail_id).is_none());
        assert!(
            sim.router(b)
                .routing_table()
                .iter()
                .all(|(_, entry)| !entry.touches(&a))
        );
    }

    #[test]
    fn finger_search_order_covers_every_slot() {
        let (a, b) = (at(100), at(200));
        let mut sim = Sim::new(&[a, b], DhtConfig::default());
        sim.link(a, b);
        let router = sim.router_mut(a);
        assert_eq!(router.next_finger_index(), SUCCESSOR_INDEX);
        router.finger_table_add(SUCCESSOR_INDEX, b, Trail::new(TrailId::from_bytes([1; 32]), vec![]));
        assert_eq!(router.next_finger_index(), PREDECESSOR_INDEX);
        router.finger_table_add(PREDECESSOR_INDEX, b, Trail::new(TrailId::from_bytes([2; 32]), vec![]));

        let order: Vec<usize> = (0..FINGER_COUNT).map(|_| router.next_finger_index()).collect();
        assert_eq!(order[0], 63);
        assert_eq!(order[62], 1);
        assert_eq!(order[63], SUCCESSOR_INDEX);
        assert_eq!(order[64], PREDECESSOR_INDEX);
        assert_eq!(router.next_finger_index(), 63);
    }
}
