//! # Peer Table
//!
//! Friends are the peers this node has a direct transport connection to.
//! Each friend owns a bounded FIFO of outbound frames; the transport drains
//! it one frame at a time as it becomes writable.
//!
//! A friend is **congested** when it carries too many trails or when it
//! recently rejected a trail setup. Congested friends are not picked as
//! first hops for new trails until the condition clears.

use std::collections::{HashMap, VecDeque};

use rand::seq::IteratorRandom;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::NodeId;

/// Priority of a queued frame. When a queue is full, a new frame may evict
/// the oldest frame of strictly lower importance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    /// Responses that can be recomputed by a retry (GET results).
    Low,
    /// Client requests in flight.
    Normal,
    /// Trail maintenance: losing these leaves dangling routing state.
    High,
}

#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub frame: Vec<u8>,
    pub importance: Importance,
    pub deadline: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after dropping an older, less important frame.
    Evicted,
    /// Queue full of equally or more important frames; the new one was dropped.
    Dropped,
}

#[derive(Debug)]
pub struct Friend {
    pub id: NodeId,
    queue: VecDeque<PendingMessage>,
    pub trail_count: u32,
    pub congested_until: Option<Instant>,
}

impl Friend {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            trail_count: 0,
            congested_until: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_congested(&self, now: Instant, trail_threshold: u32) -> bool {
        self.trail_count >= trail_threshold || self.congested_until.is_some_and(|until| now < until)
    }

    fn enqueue(&mut self, message: PendingMessage, cap: usize) -> EnqueueOutcome {
        if self.queue.len() < cap {
            self.queue.push_back(message);
            return EnqueueOutcome::Queued;
        }
        let victim = self
            .queue
            .iter()
            .position(|queued| queued.importance < message.importance);
        match victim {
            Some(index) => {
                self.queue.remove(index);
                self.queue.push_back(message);
                EnqueueOutcome::Evicted
            }
            None => EnqueueOutcome::Dropped,
        }
    }

    /// Pop the next frame that has not passed its deadline.
    /// Returns the frame and how many expired frames were discarded first.
    fn next_frame(&mut self, now: Instant) -> (Option<Vec<u8>>, usize) {
        let mut expired = 0;
        while let Some(message) = self.queue.pop_front() {
            if message.deadline <= now {
                expired += 1;
                continue;
            }
            return (Some(message.frame), expired);
        }
        (None, expired)
    }
}

#[derive(Debug)]
pub struct PeerTable {
    friends: HashMap<NodeId, Friend>,
    trail_threshold: u32,
    max_pending: usize,
}

impl PeerTable {
    pub fn new(trail_threshold: u32, max_pending: usize) -> Self {
        Self {
            friends: HashMap::new(),
            trail_threshold,
            max_pending,
        }
    }

    /// Returns false if the peer was already a friend.
    pub fn connect(&mut self, id: NodeId) -> bool {
        if self.friends.contains_key(&id) {
            return false;
        }
        self.friends.insert(id, Friend::new(id));
        true
    }

    pub fn disconnect(&mut self, id: &NodeId) -> Option<Friend> {
        self.friends.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Friend> {
        self.friends.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.friends.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.friends.keys()
    }

    pub fn is_congested(&self, id: &NodeId, now: Instant) -> bool {
        self.friends
            .get(id)
            .is_some_and(|f| f.is_congested(now, self.trail_threshold))
    }

    /// Uniform choice among friends that are not congested and not excluded.
    pub fn random_uncongested(
        &self,
        now: Instant,
        exclude: impl Fn(&NodeId) -> bool,
    ) -> Option<NodeId> {
        self.friends
            .values()
            .filter(|f| !f.is_congested(now, self.trail_threshold) && !exclude(&f.id))
            .map(|f| f.id)
            .choose(&mut rand::thread_rng())
    }

    pub fn mark_congested(&mut self, id: &NodeId, cooldown: Duration) {
        if let Some(friend) = self.friends.get_mut(id) {
            friend.congested_until = Some(Instant::now() + cooldown);
            debug!(
                peer = %id.short(),
                cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
                "friend marked congested"
            );
        }
    }

    pub fn retain_trail(&mut self, id: &NodeId) {
        if let Some(friend) = self.friends.get_mut(id) {
            friend.trail_count = friend.trail_count.saturating_add(1);
        }
    }

    pub fn release_trail(&mut self, id: &NodeId) {
        if let Some(friend) = self.friends.get_mut(id) {
            friend.trail_count = friend.trail_count.saturating_sub(1);
        }
    }

    pub fn enqueue(
        &mut self,
        id: &NodeId,
        frame: Vec<u8>,
        importance: Importance,
        timeout: Duration,
    ) -> Option<EnqueueOutcome> {
        let cap = self.max_pending;
        let friend = self.friends.get_mut(id)?;
        let outcome = friend.enqueue(
            PendingMessage {
                frame,
                importance,
                deadline: Instant::now() + timeout,
            },
            cap,
        );
        trace!(peer = %id.short(), queued = friend.pending(), outcome = ?outcome, "frame enqueued");
        Some(outcome)
    }

    pub fn next_frame(&mut self, id: &NodeId, now: Instant) -> (Option<Vec<u8>>, usize) {
        match self.friends.get_mut(id) {
            Some(friend) => friend.next_frame(now),
            None => (None, 0),
        }
    }

    pub fn peers_with_pending(&self) -> Vec<NodeId> {
        self.friends
            .values()
            .filter(|f| f.pending() > 0)
            .map(|f| f.id)
            .collect()
    }

    pub fn total_pending(&self) -> usize {
        self.friends.values().map(|f| f.pending()).sum()
    }
}
