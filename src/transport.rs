//! # In-Memory Transport
//!
//! [`MemoryNetwork`] is a registry of node endpoints joined by explicit
//! bidirectional links. It stands in for a real connection layer in the
//! simulator binary and the integration tests: links can be added and cut
//! at runtime, and each side observes `Connected`/`Disconnected` events just
//! as it would from a socket layer.
//!
//! Frames are delivered in order per link. A send on a link that does not
//! exist fails, as a write on a closed connection would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::identity::NodeId;
use crate::protocols::{PeerTransport, TransportEvent};

/// Buffered events per endpoint before senders wait.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Registry {
    endpoints: HashMap<NodeId, mpsc::Sender<TransportEvent>>,
    links: HashSet<(NodeId, NodeId)>,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Registry {
    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.contains(&link_key(a, b))
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its transport and event stream. Registering
    /// the same id again replaces the old endpoint.
    pub async fn endpoint(&self, id: NodeId) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.write().await.endpoints.insert(id, tx);
        let transport = MemoryTransport {
            me: id,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Link two registered endpoints. Both sides receive `Connected`.
    pub async fn connect(&self, a: NodeId, b: NodeId) -> Result<()> {
        if a == b {
            bail!("cannot link {} to itself", a.short());
        }
        let (tx_a, tx_b) = {
            let mut registry = self.inner.write().await;
            let tx_a = registry
                .endpoints
                .get(&a)
                .cloned()
                .ok_or_else(|| anyhow!("unknown endpoint {}", a.short()))?;
            let tx_b = registry
                .endpoints
                .get(&b)
                .cloned()
                .ok_or_else(|| anyhow!("unknown endpoint {}", b.short()))?;
            if !registry.links.insert(link_key(a, b)) {
                return Ok(());
            }
            (tx_a, tx_b)
        };
        debug!(a = %a.short(), b = %b.short(), "link up");
        let _ = tx_a.send(TransportEvent::Connected(b)).await;
        let _ = tx_b.send(TransportEvent::Connected(a)).await;
        Ok(())
    }

    /// Cut the link between `a` and `b`. Both sides receive `Disconnected`.
    pub async fn disconnect(&self, a: NodeId, b: NodeId) {
        let senders = {
            let mut registry = self.inner.write().await;
            if !registry.links.remove(&link_key(a, b)) {
                return;
            }
            (
                registry.endpoints.get(&a).cloned(),
                registry.endpoints.get(&b).cloned(),
            )
        };
        debug!(a = %a.short(), b = %b.short(), "link down");
        if let Some(tx) = senders.0 {
            let _ = tx.send(TransportEvent::Disconnected(b)).await;
        }
        if let Some(tx) = senders.1 {
            let _ = tx.send(TransportEvent::Disconnected(a)).await;
        }
    }

    /// Drop an endpoint and every link it had.
    pub async fn remove(&self, id: NodeId) {
        let peers: Vec<NodeId> = {
            let registry = self.inner.read().await;
            registry
                .links
                .iter()
                .filter_map(|(a, b)| match (*a == id, *b == id) {
                    (true, _) => Some(*b),
                    (_, true) => Some(*a),
                    _ => None,
                })
                .collect()
        };
        for peer in peers {
            self.disconnect(id, peer).await;
        }
        self.inner.write().await.endpoints.remove(&id);
    }

    pub async fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.inner.read().await.linked(a, b)
    }

    pub async fn link_count(&self) -> usize {
        self.inner.read().await.links.len()
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    me: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send(&self, to: &NodeId, frame: Vec<u8>) -> Result<()> {
        let tx = {
            let registry = self.network.inner.read().await;
            if !registry.linked(self.me, *to) {
                bail!("no link from {} to {}", self.me.short(), to.short());
            }
            registry
                .endpoints
                .get(to)
                .cloned()
                .ok_or_else(|| anyhow!("unknown endpoint {}", to.short()))?
        };
        trace!(from = %self.me.short(), to = %to.short(), len = frame.len(), "frame sent");
        tx.send(TransportEvent::Message { from: self.me, frame })
            .await
            .map_err(|_| anyhow!("endpoint {} closed", to.short()))
    }
}
