//! # xdht - Trail-Routed Ring DHT
//!
//! xdht is a structured overlay where every peer has a 256-bit identity
//! and a position on a 64-bit ring. Peers only talk to **friends** (direct
//! connections); everyone else is reached over a **trail**, a source route
//! through friends whose hops each hold one routing entry for it.
//!
//! - **Fingers**: 65 slots per node, a successor (`my + 1`), 63 power-of-two
//!   offsets and a predecessor (`my - 1`), each reached over up to
//!   `max_trails_per_finger` trails
//! - **Trail setup**: greedy search toward a target value that installs
//!   routing state on the way back, with congestion backtracking
//! - **Successor maintenance**: periodic verification that replaces the
//!   successor with a closer peer and announces itself to it
//! - **Requests**: PUT and GET routed to the peer closest to a key, with
//!   optional route recording, replication and peer lookup
//!
//! ## Architecture
//!
//! The routing core ([`Router`]) is synchronous: one event in, zero or more
//! frames queued out. [`DhtNode`] wraps it in the actor pattern, a cloneable
//! handle sending commands to a private task that owns the router, so all
//! routing state is touched by exactly one task.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Node ids, ring values, Ed25519 keypairs, contacts |
//! | `metric` | Prefix distance and ring closeness |
//! | `bloom` | Fixed-size Bloom filters for visited peers and known replies |
//! | `messages` | Wire types and the length-prefixed codec |
//! | `routing` | Per-trail routing entries held by intermediates |
//! | `friends` | Direct peers, their send queues and congestion state |
//! | `fingers` | Finger slots and their trails |
//! | `store` | Content store, block types and reply validation |
//! | `router` | Table ownership, next-hop resolution, dispatch |
//! | `trails` | Trail setup, rejection, teardown, compression |
//! | `successor` | Successor verification and predecessor adoption |
//! | `requests` | PUT, GET and result routing |
//! | `node` | Async actor driving a router over a transport |
//! | `protocols` | Transport trait and events |
//! | `transport` | In-memory transport for simulation |
//! | `config` | Tunables and their defaults |

mod bloom;
mod config;
mod error;
mod fingers;
mod friends;
mod identity;
mod messages;
mod metric;
mod node;
mod protocols;
mod requests;
mod router;
mod routing;
mod store;
mod successor;
mod trails;
mod transport;

#[cfg(test)]
mod testutil;

pub use bloom::BloomFilter;
pub use config::DhtConfig;
pub use error::{RouterError, StoreError};
pub use fingers::{
    FINGER_COUNT, FingerEntry, FingerTable, FingerUpdate, PREDECESSOR_INDEX, SUCCESSOR_INDEX, Trail,
    finger_index, finger_target,
};
pub use friends::{EnqueueOutcome, Importance, PeerTable};
pub use identity::{Contact, Keypair, NodeId, key_for, now_ms};
pub use messages::{Direction, MessageType, PeerMessage, RouteOptions, TrailId, decode, encode};
pub use metric::{
    Closeness, distance, inverse_distance, is_between, matching_prefix_bits, select_closest_peer,
    select_closest_predecessor,
};
pub use node::DhtNode;
pub use protocols::{PeerTransport, TransportEvent};
pub use requests::{GetRequest, PutRequest};
pub use routing::{RoutingEntry, TrailRoutingTable};
pub use router::{FingerSummary, GetReply, Router, RouterEvent, RouterStats, SearchId, TelemetrySnapshot};
pub use store::{
    BlockType, BlockValidator, ContentStore, DefaultValidator, EvaluationResult, LocalStore, PutMeta,
    Record, decode_hello, encode_hello,
};
pub use transport::{MemoryNetwork, MemoryTransport};
