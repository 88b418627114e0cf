//! Whole-node scenarios over the in-memory network.
//!
//! Nodes are laid out on a ring of direct links in identity order, so each
//! node's true successor and predecessor are also its friends. Time is
//! paused; the runtime advances the clock whenever every task is idle.

use std::time::Duration;

use xdht::{
    BlockType, DhtConfig, DhtNode, GetRequest, Keypair, MemoryNetwork, NodeId, PutRequest,
    RouteOptions, key_for,
};

const SETTLE_ROUNDS: usize = 200;

struct Ring {
    network: MemoryNetwork,
    nodes: Vec<DhtNode>,
}

async fn build_ring(count: usize) -> Ring {
    let network = MemoryNetwork::new();
    let mut nodes = Vec::with_capacity(count);
    for seed in 0..count {
        let mut secret = [0u8; 32];
        secret[..8].copy_from_slice(&(seed as u64 + 1).to_be_bytes());
        let keypair = Keypair::from_secret_key_bytes(&secret);
        let contact = keypair.contact(vec![format!("mem:{seed}")]);
        let (transport, events) = network.endpoint(contact.identity).await;
        nodes.push(DhtNode::spawn(contact, DhtConfig::fast(), transport, events).unwrap());
    }
    nodes.sort_by_key(|node| node.identity().ring_value());
    for i in 0..count {
        let next = (i + 1) % count;
        network
            .connect(nodes[i].identity(), nodes[next].identity())
            .await
            .unwrap();
    }
    Ring { network, nodes }
}

impl Ring {
    fn id(&self, index: usize) -> NodeId {
        self.nodes[index % self.nodes.len()].identity()
    }

    fn successor_of(&self, index: usize) -> NodeId {
        self.id(index + 1)
    }

    fn predecessor_of(&self, index: usize) -> NodeId {
        self.id(index + self.nodes.len() - 1)
    }

    async fn ring_converged(&self) -> bool {
        for (i, node) in self.nodes.iter().enumerate() {
            let snapshot = node.telemetry().await.unwrap();
            if snapshot.successor != Some(self.successor_of(i))
                || snapshot.predecessor != Some(self.predecessor_of(i))
            {
                return false;
            }
        }
        true
    }

    async fn wait_converged(&self) {
        for _ in 0..SETTLE_ROUNDS {
            if self.ring_converged().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for (i, node) in self.nodes.iter().enumerate() {
            let snapshot = node.telemetry().await.unwrap();
            eprintln!(
                "node {i} {}: successor {:?} predecessor {:?}",
                self.id(i).short(),
                snapshot.successor.map(|s| s.short()),
                snapshot.predecessor.map(|p| p.short())
            );
        }
        panic!("ring did not converge");
    }

    async fn quit(&self) {
        for node in &self.nodes {
            node.quit().await;
        }
    }
}

fn data_put(value: &[u8]) -> PutRequest {
    PutRequest {
        key: key_for(value),
        value: value.to_vec(),
        block_type: BlockType::Data,
        options: RouteOptions::RECORD_ROUTE,
        replication: 1,
        expiration_ms: 0,
    }
}

fn data_get(key: NodeId) -> GetRequest {
    GetRequest {
        key,
        block_type: BlockType::Data,
        options: RouteOptions::RECORD_ROUTE,
        replication: 1,
        xquery: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn ring_converges_on_true_neighbours() {
    let ring = build_ring(6).await;
    ring.wait_converged().await;

    let fingers = ring.nodes[0].fingers().await.unwrap();
    assert!(fingers.iter().any(|f| f.index == 0 && f.identity == ring.successor_of(0)));
    assert!(fingers.iter().any(|f| f.index == 64 && f.identity == ring.predecessor_of(0)));
    ring.quit().await;
}

#[tokio::test(start_paused = true)]
async fn value_put_on_one_node_is_found_from_another() {
    let ring = build_ring(6).await;
    ring.wait_converged().await;

    let value = b"scenario payload";
    ring.nodes[0].put(data_put(value)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let replies = ring.nodes[3].get(data_get(key_for(value))).await.unwrap();
    let reply = replies
        .iter()
        .find(|r| r.value == value)
        .expect("value should be found");
    assert_eq!(reply.key, key_for(value));
    assert!(reply.get_path.iter().all(|hop| *hop != ring.id(3)));

    let stored: usize = {
        let mut total = 0;
        for node in &ring.nodes {
            total += node.telemetry().await.unwrap().stored_records;
        }
        total
    };
    assert!(stored >= 1);
    ring.quit().await;
}

#[tokio::test(start_paused = true)]
async fn missing_key_returns_nothing() {
    let ring = build_ring(4).await;
    ring.wait_converged().await;

    let replies = ring.nodes[1].get(data_get(key_for(b"never stored"))).await.unwrap();
    assert!(replies.is_empty());
    ring.quit().await;
}

#[tokio::test(start_paused = true)]
async fn find_peer_locates_a_non_friend() {
    let ring = build_ring(6).await;
    ring.wait_converged().await;

    let target = ring.id(3);
    let contact = ring.nodes[0]
        .find_peer(target)
        .await
        .unwrap()
        .expect("target should answer");
    assert_eq!(contact.identity, target);
    assert!(contact.primary_addr().is_some_and(|addr| addr.starts_with("mem:")));
    ring.quit().await;
}

#[tokio::test(start_paused = true)]
async fn lost_link_is_routed_around() {
    let ring = build_ring(5).await;
    ring.wait_converged().await;

    ring.network.disconnect(ring.id(0), ring.id(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = ring.nodes[0].telemetry().await.unwrap();
    assert_eq!(snapshot.friends, 1);

    // The successor is now only reachable the long way round.
    let mut recovered = false;
    for _ in 0..SETTLE_ROUNDS {
        if ring.nodes[0].telemetry().await.unwrap().successor == Some(ring.successor_of(0)) {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "node 0 should find its successor over a trail");

    let trails = ring.nodes[0].fingers().await.unwrap();
    let successor = trails.iter().find(|f| f.index == 0).unwrap();
    assert!(successor.trail_lengths.iter().all(|len| *len > 0));
    ring.quit().await;
}
