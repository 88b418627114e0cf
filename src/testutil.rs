//! Deterministic in-process network of routers for protocol tests.
//!
//! `Sim` owns one [`Router`] per identity and moves frames between them by
//! draining each router's outbound queues. Every delivered frame is logged
//! so tests can assert on who sent what to whom.

use std::collections::BTreeMap;

use crate::config::DhtConfig;
use crate::identity::{Contact, NodeId};
use crate::messages::{self, MessageType, PeerMessage};
use crate::router::Router;

pub(crate) fn make_identity(index: u32) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(bytes)
}

/// Identity with the given ring value.
pub(crate) fn at(value: u64) -> NodeId {
    NodeId::from_ring_value(value)
}

fn router_for(id: NodeId, config: DhtConfig) -> Router {
    Router::with_defaults(Contact::single(id, format!("mem:{}", id.short())), config)
}

pub(crate) struct Sim {
    routers: BTreeMap<NodeId, Router>,
    log: Vec<(NodeId, NodeId, MessageType)>,
}

impl Sim {
    pub fn new(ids: &[NodeId], config: DhtConfig) -> Self {
        let routers = ids
            .iter()
            .map(|id| (*id, router_for(*id, config.clone())))
            .collect();
        Self {
            routers,
            log: Vec::new(),
        }
    }

    /// Swap in a fresh router with its own configuration. Call before linking.
    pub fn replace_router(&mut self, id: NodeId, config: DhtConfig) {
        self.routers.insert(id, router_for(id, config));
    }

    pub fn router(&self, id: NodeId) -> &Router {
        self.routers.get(&id).expect("unknown router")
    }

    pub fn router_mut(&mut self, id: NodeId) -> &mut Router {
        self.routers.get_mut(&id).expect("unknown router")
    }

    pub fn link(&mut self, a: NodeId, b: NodeId) {
        self.router_mut(a).on_peer_connected(b);
        self.router_mut(b).on_peer_connected(a);
    }

    pub fn unlink(&mut self, a: NodeId, b: NodeId) {
        self.router_mut(a).on_peer_disconnected(&b);
        self.router_mut(b).on_peer_disconnected(&a);
    }

    /// Hand `msg` to `to` as if `from` had sent it.
    pub fn deliver(&mut self, from: NodeId, to: NodeId, msg: PeerMessage) {
        let frame = messages::encode(&msg).expect("encodable test message");
        self.log.push((from, to, msg.message_type()));
        self.router_mut(to).on_message(from, &frame);
    }

    /// Deliver every frame queued right now. Returns how many moved.
    pub fn step(&mut self) -> usize {
        let mut batch = Vec::new();
        for (id, router) in self.routers.iter_mut() {
            for peer in router.peers_with_pending() {
                while let Some(frame) = router.next_frame(&peer) {
                    batch.push((*id, peer, frame));
                }
            }
        }
        let moved = batch.len();
        for (from, to, frame) in batch {
            if let Ok(msg) = messages::decode(&frame) {
                self.log.push((from, to, msg.message_type()));
            }
            if let Some(router) = self.routers.get_mut(&to)
                && router.is_friend(&from)
            {
                router.on_message(from, &frame);
            }
        }
        moved
    }

    /// Step until no frames are left in flight.
    pub fn run(&mut self) {
        for _ in 0..10_000 {
            if self.step() == 0 {
                return;
            }
        }
        panic!("simulation did not settle");
    }

    /// How many messages of `kind` went from `from` to `to`.
    pub fn sent(&self, from: NodeId, to: NodeId, kind: MessageType) -> usize {
        self.log
            .iter()
            .filter(|(f, t, k)| *f == from && *t == to && *k == kind)
            .count()
    }
}
