//! # Router
//!
//! The `Router` owns every table a node keeps (friends, fingers, trail
//! routing entries, content store) and is the single place they are mutated.
//! It is a synchronous state machine: each transport event, timer tick or
//! client call runs to completion and leaves outbound frames in the
//! per-friend queues. The async node actor (see `node.rs`) feeds it events
//! and drains those queues.
//!
//! Protocol handlers are split by concern:
//!
//! | File | Messages |
//! |------|----------|
//! | `trails.rs` | `TrailSetup`, `TrailSetupResult`, `TrailRejected`, `TrailTeardown`, `TrailCompression`, `AddTrail` |
//! | `successor.rs` | `VerifySuccessor`, `VerifySuccessorResult`, `NotifyNewSuccessor` |
//! | `requests.rs` | `Put`, `Get`, `GetResult` |
//!
//! Malformed input never escapes: handlers return `RouterError`, and
//! [`Router::on_message`] logs and drops it.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::bloom::BloomFilter;
use crate::config::DhtConfig;
use crate::error::RouterError;
use crate::fingers::{FingerEntry, FingerTable, FingerUpdate, SUCCESSOR_INDEX, Trail};
use crate::friends::{EnqueueOutcome, Importance, PeerTable};
use crate::identity::{Contact, NodeId};
use crate::messages::{self, Direction, PeerMessage, RouteOptions, TrailId, TrailTeardown};
use crate::metric::{self, Closeness};
use crate::routing::{RoutingEntry, TrailRoutingTable};
use crate::store::{BlockType, BlockValidator, ContentStore, DefaultValidator, LocalStore};

/// Where a message goes next and which peer it is ultimately heading for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NextHop {
    pub destination: NodeId,
    pub next_hop: NodeId,
    /// Trail to `destination` when it is not a friend.
    pub trail_id: Option<TrailId>,
}

/// An outstanding search for one finger slot.
#[derive(Clone, Debug)]
pub(crate) struct DiscoveryRound {
    pub index: usize,
    pub first_hop: NodeId,
    pub retried: bool,
    pub deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchId(pub(crate) u64);

/// One accepted answer to a GET.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetReply {
    pub key: NodeId,
    pub block_type: BlockType,
    pub value: Vec<u8>,
    pub expiration_ms: u64,
    /// Empty unless the GET asked for `RECORD_ROUTE`.
    pub put_path: Vec<NodeId>,
    /// Empty unless the GET asked for `RECORD_ROUTE`.
    pub get_path: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub(crate) struct Search {
    pub key: NodeId,
    pub block_type: BlockType,
    pub options: RouteOptions,
    pub xquery: Vec<u8>,
    pub reply_filter: BloomFilter,
    pub results: Vec<GetReply>,
    pub done: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterEvent {
    /// A search received a unique answer and needs no more.
    SearchComplete(SearchId),
    SuccessorChanged { old: Option<NodeId>, new: NodeId },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub malformed_dropped: u64,
    pub queue_dropped: u64,
    pub queue_expired: u64,
    pub trails_rejected: u64,
    pub teardowns_sent: u64,
    pub rounds_expired: u64,
    pub records_stored: u64,
    pub results_delivered: u64,
}

#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub friends: usize,
    pub fingers: usize,
    pub successor: Option<NodeId>,
    pub predecessor: Option<NodeId>,
    pub routing_entries: usize,
    pub pending_frames: usize,
    pub stored_records: usize,
    pub store_utilization: f32,
    pub rounds_in_flight: usize,
    pub searches_in_flight: usize,
    pub stats: RouterStats,
}

/// Summary of one finger slot, for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FingerSummary {
    pub index: usize,
    pub identity: NodeId,
    pub trail_lengths: Vec<usize>,
}

pub struct Router {
    pub(crate) me: NodeId,
    pub(crate) contact: Contact,
    pub(crate) config: DhtConfig,
    pub(crate) friends: PeerTable,
    pub(crate) fingers: FingerTable,
    pub(crate) routing: TrailRoutingTable,
    pub(crate) store: Box<dyn ContentStore>,
    pub(crate) validator: Box<dyn BlockValidator>,
    pub(crate) rounds: HashMap<TrailId, DiscoveryRound>,
    pub(crate) finger_cursor: usize,
    pub(crate) searches: HashMap<SearchId, Search>,
    pub(crate) next_search_id: u64,
    pub(crate) events: VecDeque<RouterEvent>,
    pub(crate) stats: RouterStats,
}

impl Router {
    pub fn new(
        contact: Contact,
        config: DhtConfig,
        store: Box<dyn ContentStore>,
        validator: Box<dyn BlockValidator>,
    ) -> Self {
        let me = contact.identity;
        Self {
            me,
            contact,
            friends: PeerTable::new(config.friend_trail_threshold, config.max_pending_per_peer),
            fingers: FingerTable::new(me, config.max_trails_per_finger),
            routing: TrailRoutingTable::new(config.routing_table_threshold),
            store,
            validator,
            rounds: HashMap::new(),
            finger_cursor: 0,
            searches: HashMap::new(),
            next_search_id: 0,
            events: VecDeque::new(),
            stats: RouterStats::default(),
            config,
        }
    }

    /// Router backed by an in-memory [`LocalStore`] and the built-in validator.
    pub fn with_defaults(contact: Contact, config: DhtConfig) -> Self {
        let store = Box::new(LocalStore::new(config.store_capacity));
        Self::new(contact, config, store, Box::new(DefaultValidator))
    }

    pub fn node_id(&self) -> NodeId {
        self.me
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn successor(&self) -> Option<NodeId> {
        self.fingers.successor().map(|f| f.identity)
    }

    pub fn predecessor(&self) -> Option<NodeId> {
        self.fingers.predecessor().map(|f| f.identity)
    }

    pub fn finger(&self, index: usize) -> Option<&FingerEntry> {
        self.fingers.get(index)
    }

    pub fn finger_summaries(&self) -> Vec<FingerSummary> {
        self.fingers
            .iter()
            .map(|entry| FingerSummary {
                index: entry.index,
                identity: entry.identity,
                trail_lengths: entry.trails.iter().map(|t| t.len()).collect(),
            })
            .collect()
    }

    pub fn routing_table(&self) -> &TrailRoutingTable {
        &self.routing
    }

    pub fn is_friend(&self, peer: &NodeId) -> bool {
        self.friends.contains(peer)
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            friends: self.friends.len(),
            fingers: self.fingers.installed(),
            successor: self.successor(),
            predecessor: self.predecessor(),
            routing_entries: self.routing.len(),
            pending_frames: self.friends.total_pending(),
            stored_records: self.store.len(),
            store_utilization: self.store.utilization(),
            rounds_in_flight: self.rounds.len(),
            searches_in_flight: self.searches.len(),
            stats: self.stats,
        }
    }

    pub fn take_events(&mut self) -> Vec<RouterEvent> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Returns true when `peer` is the first friend, the moment a node
    /// should start looking for fingers.
    pub fn on_peer_connected(&mut self, peer: NodeId) -> bool {
        if peer == self.me {
            return false;
        }
        if !self.friends.connect(peer) {
            return false;
        }
        info!(peer = %peer.short(), friends = self.friends.len(), "friend connected");
        self.friends.len() == 1
    }

    /// Forget `peer` and every trail that ran through it. Surviving
    /// neighbours on those trails get a teardown so they can do the same.
    pub fn on_peer_disconnected(&mut self, peer: &NodeId) {
        if self.friends.disconnect(peer).is_none() {
            return;
        }
        let routes = self.routing.remove_all_for_peer(peer);
        for (trail_id, entry) in &routes {
            let (survivor, direction) = if entry.prev_hop == *peer {
                (entry.next_hop, Direction::SrcToDest)
            } else {
                (entry.prev_hop, Direction::DestToSrc)
            };
            self.friends.release_trail(&survivor);
            self.send_teardown(survivor, *trail_id, direction);
        }

        let lost = self.fingers.remove_first_hop(peer);
        for (finger, trail) in &lost {
            debug!(
                finger = %finger.short(),
                trail = %trail.id.short(),
                "finger trail lost with first hop"
            );
        }
        self.rounds.retain(|_, round| round.first_hop != *peer);
        info!(
            peer = %peer.short(),
            routes_removed = routes.len(),
            finger_trails_removed = lost.len(),
            "friend disconnected"
        );
    }

    /// Decode and dispatch one frame from `from`. Never fails: anything
    /// malformed or out of place is logged and dropped.
    pub fn on_message(&mut self, from: NodeId, frame: &[u8]) {
        if let Err(e) = self.dispatch(from, frame) {
            debug!(peer = %from.short(), error = %e, "message dropped");
            self.stats.malformed_dropped += 1;
        }
    }

    fn dispatch(&mut self, from: NodeId, frame: &[u8]) -> Result<(), RouterError> {
        if !self.friends.contains(&from) {
            return Err(RouterError::UnknownPeer(from));
        }
        let message = messages::decode(frame)?;
        trace!(peer = %from.short(), kind = ?message.message_type(), "message received");
        match message {
            PeerMessage::TrailSetup(m) => self.handle_trail_setup(from, m),
            PeerMessage::TrailSetupResult(m) => self.handle_trail_setup_result(from, m),
            PeerMessage::TrailRejected(m) => self.handle_trail_rejected(from, m),
            PeerMessage::TrailTeardown(m) => self.handle_trail_teardown(from, m),
            PeerMessage::TrailCompression(m) => self.handle_trail_compression(from, m),
            PeerMessage::AddTrail(m) => self.handle_add_trail(from, m),
            PeerMessage::VerifySuccessor(m) => self.handle_verify_successor(from, m),
            PeerMessage::VerifySuccessorResult(m) => self.handle_verify_successor_result(from, m),
            PeerMessage::NotifyNewSuccessor(m) => self.handle_notify_new_successor(from, m),
            PeerMessage::Put(m) => self.handle_put(Some(from), m),
            PeerMessage::Get(m) => self.handle_get(Some(from), m),
            PeerMessage::GetResult(m) => self.handle_get_result(from, m),
        }
    }

    /// Next frame queued for `peer`, skipping expired ones.
    pub fn next_frame(&mut self, peer: &NodeId) -> Option<Vec<u8>> {
        let (frame, expired) = self.friends.next_frame(peer, Instant::now());
        if expired > 0 {
            debug!(peer = %peer.short(), expired, "dropped expired frames");
            self.stats.queue_expired += expired as u64;
        }
        frame
    }

    pub fn peers_with_pending(&self) -> Vec<NodeId> {
        self.friends.peers_with_pending()
    }

    /// Drop expired discovery rounds.
    pub fn expire_rounds(&mut self) -> usize {
        let now = Instant::now();
        let before = self.rounds.len();
        self.rounds.retain(|trail_id, round| {
            let alive = round.deadline > now;
            if !alive {
                debug!(trail = %trail_id.short(), index = round.index, "discovery round expired");
            }
            alive
        });
        let expired = before - self.rounds.len();
        self.stats.rounds_expired += expired as u64;
        expired
    }

    /// Tear down every trail this node created. Called on shutdown.
    pub fn shutdown(&mut self) {
        let entries: Vec<FingerEntry> = self.fingers.iter().cloned().collect();
        for entry in entries {
            self.fingers.remove(entry.index);
            for trail in entry.trails {
                self.release_finger_trail(&entry.identity, &trail);
            }
        }
        self.rounds.clear();
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    pub(crate) fn send(&mut self, to: NodeId, message: PeerMessage, importance: Importance) -> bool {
        let frame = match messages::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %to.short(), kind = ?message.message_type(), error = %e, "cannot encode message");
                return false;
            }
        };
        match self.friends.enqueue(&to, frame, importance, self.config.message_timeout) {
            Some(EnqueueOutcome::Dropped) => {
                debug!(peer = %to.short(), kind = ?message.message_type(), "outbound queue full, message dropped");
                self.stats.queue_dropped += 1;
                false
            }
            Some(EnqueueOutcome::Evicted) => {
                self.stats.queue_dropped += 1;
                true
            }
            Some(EnqueueOutcome::Queued) => true,
            None => {
                debug!(peer = %to.short(), kind = ?message.message_type(), "next hop is not a friend");
                false
            }
        }
    }

    pub(crate) fn send_teardown(&mut self, to: NodeId, trail_id: TrailId, direction: Direction) {
        self.stats.teardowns_sent += 1;
        self.send(
            to,
            PeerMessage::TrailTeardown(TrailTeardown { trail_id, direction }),
            Importance::High,
        );
    }

    // ------------------------------------------------------------------
    // Table mutation with trail accounting
    // ------------------------------------------------------------------

    /// Add a routing entry and count it against both neighbours.
    pub(crate) fn install_route(
        &mut self,
        trail_id: TrailId,
        prev_hop: NodeId,
        next_hop: NodeId,
    ) -> Result<(), RouterError> {
        if self.routing.add(trail_id, prev_hop, next_hop)? {
            self.friends.retain_trail(&prev_hop);
            self.friends.retain_trail(&next_hop);
            trace!(trail = %trail_id.short(), prev = %prev_hop.short(), next = %next_hop.short(), "route installed");
        }
        Ok(())
    }

    pub(crate) fn drop_route(&mut self, trail_id: &TrailId) -> Option<RoutingEntry> {
        let entry = self.routing.remove(trail_id)?;
        self.friends.release_trail(&entry.prev_hop);
        self.friends.release_trail(&entry.next_hop);
        Some(entry)
    }

    pub(crate) fn retarget_prev_hop(&mut self, trail_id: &TrailId, new_prev: NodeId) -> bool {
        match self.routing.update_prev_hop(trail_id, new_prev) {
            Some(old) => {
                self.friends.release_trail(&old);
                self.friends.retain_trail(&new_prev);
                true
            }
            None => false,
        }
    }

    /// Offer a trail for finger slot `index`. Losing trails (displaced,
    /// evicted or rejected) are torn down. Returns true if the offered
    /// trail was kept.
    pub(crate) fn finger_table_add(&mut self, index: usize, identity: NodeId, trail: Trail) -> bool {
        let first_hop = trail.first_hop(&identity);
        let old_successor = if index == SUCCESSOR_INDEX {
            self.successor()
        } else {
            None
        };
        match self.fingers.insert(index, identity, trail) {
            FingerUpdate::Installed { displaced } => {
                self.friends.retain_trail(&first_hop);
                if let Some(old) = displaced {
                    for t in &old.trails {
                        self.release_finger_trail(&old.identity, t);
                    }
                }
                if index == SUCCESSOR_INDEX {
                    info!(old = ?old_successor.map(|s| s.short()), new = %identity.short(), "successor changed");
                    self.events.push_back(RouterEvent::SuccessorChanged {
                        old: old_successor,
                        new: identity,
                    });
                } else {
                    debug!(index, finger = %identity.short(), "finger installed");
                }
                true
            }
            FingerUpdate::TrailAdded { evicted } => {
                self.friends.retain_trail(&first_hop);
                if let Some(t) = evicted {
                    self.release_finger_trail(&identity, &t);
                }
                true
            }
            FingerUpdate::Rejected(t) => {
                if let Some(hop) = t.hops.first() {
                    self.send_teardown(*hop, t.id, Direction::SrcToDest);
                }
                false
            }
            FingerUpdate::Unchanged => false,
        }
    }

    /// Stop counting a finger trail against its first hop and tell the
    /// intermediates to forget it.
    pub(crate) fn release_finger_trail(&mut self, finger: &NodeId, trail: &Trail) {
        self.friends.release_trail(&trail.first_hop(finger));
        if let Some(hop) = trail.hops.first() {
            self.send_teardown(*hop, trail.id, Direction::SrcToDest);
        }
    }

    /// Index in `hops` the trail can start from: the last hop that is
    /// already a friend, or `hops.len()` when the finger itself is one.
    pub(crate) fn compression_start(&self, finger: &NodeId, hops: &[NodeId]) -> usize {
        if hops.is_empty() {
            return 0;
        }
        if self.friends.contains(finger) {
            return hops.len();
        }
        (1..hops.len())
            .rev()
            .find(|&i| self.friends.contains(&hops[i]))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Next-hop resolution
    // ------------------------------------------------------------------

    /// Pick the known peer closest to `target`: ourselves, a friend, or a
    /// finger reached over its shortest usable trail. `carried` is the
    /// destination the previous hop chose, with the trail it used; it wins
    /// if nothing closer is known locally.
    pub(crate) fn find_best_destination(
        &self,
        target: u64,
        closeness: Closeness,
        carried: Option<(NodeId, Option<TrailId>)>,
        skip: &dyn Fn(&NodeId) -> bool,
        avoid_congested: bool,
    ) -> NextHop {
        let now = Instant::now();
        let usable = |peer: &NodeId| {
            self.friends.contains(peer)
                && !skip(peer)
                && !(avoid_congested && self.friends.is_congested(peer, now))
        };
        let mut best = NextHop {
            destination: self.me,
            next_hop: self.me,
            trail_id: None,
        };
        let mut consider = |candidate: NextHop| {
            if metric::compare(target, closeness, &candidate.destination, &best.destination)
                == std::cmp::Ordering::Less
            {
                best = candidate;
            }
        };

        for friend in self.friends.ids() {
            if usable(friend) {
                consider(NextHop {
                    destination: *friend,
                    next_hop: *friend,
                    trail_id: None,
                });
            }
        }

        for entry in self.fingers.iter() {
            if entry.identity == self.me || skip(&entry.identity) {
                continue;
            }
            let trail = entry
                .trails
                .iter()
                .filter(|t| usable(&t.first_hop(&entry.identity)))
                .min_by_key(|t| t.len());
            if let Some(trail) = trail {
                consider(NextHop {
                    destination: entry.identity,
                    next_hop: trail.first_hop(&entry.identity),
                    trail_id: (!trail.is_empty()).then_some(trail.id),
                });
            }
        }

        if let Some((destination, Some(trail_id))) = carried
            && destination != self.me
            && !skip(&destination)
            && let Some(next_hop) = self.routing.lookup(&trail_id, Direction::SrcToDest)
            && self.friends.contains(&next_hop)
            && metric::compare(target, closeness, &destination, &best.destination)
                == std::cmp::Ordering::Less
        {
            best = NextHop {
                destination,
                next_hop,
                trail_id: Some(trail_id),
            };
        }
        best
    }
}

/// Remove loops from a trail from `me` to `destination`: drop everything up
/// to our own last appearance, cut at the destination's first appearance,
/// and splice out any cycle between repeated appearances of a peer.
pub(crate) fn shorten_trail(me: &NodeId, destination: &NodeId, mut hops: Vec<NodeId>) -> Vec<NodeId> {
    if let Some(pos) = hops.iter().rposition(|h| h == me) {
        hops.drain(..=pos);
    }
    if let Some(pos) = hops.iter().position(|h| h == destination) {
        hops.truncate(pos);
    }
    let mut out = Vec::with_capacity(hops.len());
    let mut i = 0;
    while i < hops.len() {
        let hop = hops[i];
        let last = hops.iter().rposition(|h| *h == hop).unwrap_or(i);
        out.push(hop);
        i = last + 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, make_identity};

    fn router_at(value: u64) -> Router {
        Router::with_defaults(Contact::single(at(value), "mem"), DhtConfig::default())
    }

    #[test]
    fn shorten_trail_removes_cycles() {
        let me = make_identity(1);
        let dest = make_identity(9);
        let (a, b, c, d) = (make_identity(2), make_identity(3), make_identity(4), make_identity(5));
        assert_eq!(shorten_trail(&me, &dest, vec![a, b, c, b, d]), vec![a, b, d]);
        assert_eq!(shorten_trail(&me, &dest, vec![a, me, c]), vec![c]);
        assert_eq!(shorten_trail(&me, &dest, vec![a, dest, c]), vec![a]);
        assert_eq!(shorten_trail(&me, &dest, vec![a, b]), vec![a, b]);
    }

    #[test]
    fn first_friend_is_reported() {
        let mut router = router_at(100);
        assert!(router.on_peer_connected(at(200)));
        assert!(!router.on_peer_connected(at(300)));
        assert!(!router.on_peer_connected(at(200)));
        assert!(!router.on_peer_connected(at(100)));
    }

    #[test]
    fn frames_from_strangers_are_dropped() {
        let mut router = router_at(100);
        assert_eq!(router.dispatch(at(5), &[0, 4, 0, 1]), Err(RouterError::UnknownPeer(at(5))));
        router.on_message(at(5), &[0, 4, 0, 1]);
        assert_eq!(router.stats().malformed_dropped, 1);
    }

    #[test]
    fn garbage_from_friend_is_dropped_without_state_change() {
        let mut router = router_at(100);
        router.on_peer_connected(at(200));
        router.on_message(at(200), &[0, 9, 0, 4, 1, 2, 3, 4, 5]);
        router.on_message(at(200), &[0, 5, 0, 4, 1]);
        assert_eq!(router.stats().malformed_dropped, 2);
        assert!(router.routing_table().is_empty());
        assert!(router.peers_with_pending().is_empty());
    }

    #[test]
    fn best_destination_prefers_closest_friend() {
        let mut router = router_at(100);
        router.on_peer_connected(at(150));
        router.on_peer_connected(at(400));
        let hop = router.find_best_destination(120, Closeness::Successor, None, &|_| false, false);
        assert_eq!(hop.destination, at(150));
        assert_eq!(hop.next_hop, at(150));
        assert_eq!(hop.trail_id, None);

        let hop = router.find_best_destination(99, Closeness::Successor, None, &|_| false, false);
        assert_eq!(hop.destination, at(100));
    }

    #[test]
    fn best_destination_uses_finger_trail() {
        let mut router = router_at(100);
        let friend = at(900);
        router.on_peer_connected(friend);
        let trail_id = TrailId::from_bytes([3; 32]);
        router.finger_table_add(0, at(110), Trail::new(trail_id, vec![friend]));
        let hop = router.find_best_destination(105, Closeness::Successor, None, &|_| false, false);
        assert_eq!(hop.destination, at(110));
        assert_eq!(hop.next_hop, friend);
        assert_eq!(hop.trail_id, Some(trail_id));
    }

    #[test]
    fn skipped_and_congested_peers_are_avoided() {
        let mut router = router_at(100);
        router.on_peer_connected(at(150));
        router.on_peer_connected(at(160));
        let hop = router.find_best_destination(120, Closeness::Successor, None, &|p| *p == at(150), false);
        assert_eq!(hop.destination, at(160));

        router.friends.mark_congested(&at(160), router.config.congestion_timeout);
        let hop = router.find_best_destination(120, Closeness::Successor, None, &|p| *p == at(150), true);
        assert_eq!(hop.destination, at(100));
    }

    #[test]
    fn carried_destination_followed_when_closer() {
        let mut router = router_at(100);
        let (prev, next) = (at(50), at(500));
        router.on_peer_connected(prev);
        router.on_peer_connected(next);
        let trail_id = TrailId::from_bytes([8; 32]);
        router.install_route(trail_id, prev, next).unwrap();
        let far_end = at(130);
        let hop = router.find_best_destination(
            120,
            Closeness::Successor,
            Some((far_end, Some(trail_id))),
            &|_| false,
            false,
        );
        assert_eq!(hop, NextHop { destination: far_end, next_hop: next, trail_id: Some(trail_id) });
    }

    #[test]
    fn route_accounting_tracks_friend_trail_counts() {
        let mut router = router_at(100);
        let (a, b) = (at(1), at(2));
        router.on_peer_connected(a);
        router.on_peer_connected(b);
        let trail_id = TrailId::from_bytes([1; 32]);
        router.install_route(trail_id, a, b).unwrap();
        router.install_route(trail_id, a, b).unwrap();
        assert_eq!(router.friends.get(&a).unwrap().trail_count, 1);
        router.drop_route(&trail_id);
        assert_eq!(router.friends.get(&a).unwrap().trail_count, 0);
        assert_eq!(router.friends.get(&b).unwrap().trail_count, 0);
    }

    #[test]
    fn disconnect_tears_down_toward_survivor() {
        let mut router = router_at(100);
        let (a, b) = (at(1), at(2));
        router.on_peer_connected(a);
        router.on_peer_connected(b);
        let trail_id = TrailId::from_bytes([1; 32]);
        router.install_route(trail_id, a, b).unwrap();
        router.on_peer_disconnected(&a);
        assert!(router.routing_table().is_empty());
        let frame = router.next_frame(&b).unwrap();
        match messages::decode(&frame).unwrap() {
            PeerMessage::TrailTeardown(t) => {
                assert_eq!(t.trail_id, trail_id);
                assert_eq!(t.direction, Direction::SrcToDest);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn compression_start_finds_last_friend() {
        let mut router = router_at(100);
        let (a, b, c) = (at(1), at(2), at(3));
        router.on_peer_connected(a);
        router.on_peer_connected(b);
        assert_eq!(router.compression_start(&at(50), &[a, c, b, c]), 2);
        assert_eq!(router.compression_start(&at(50), &[a, c]), 0);
        assert_eq!(router.compression_start(&b, &[a, c]), 2);
        assert_eq!(router.compression_start(&b, &[]), 0);
    }
}
