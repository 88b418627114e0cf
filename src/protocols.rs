//! Transport abstraction the node actor runs on.
//!
//! The routing core never touches sockets. A node is handed a
//! [`PeerTransport`] to push frames to friends and an event channel of
//! [`TransportEvent`]s to learn about connections and incoming frames.
//!
//! | Item | Direction | Purpose |
//! |------|-----------|---------|
//! | [`PeerTransport::send`] | node → transport | Deliver one encoded frame to a connected friend |
//! | [`TransportEvent`] | transport → node | Connection changes and inbound frames |
//!
//! Frames are opaque here; size and framing are checked by the codec in
//! `messages.rs`. Encryption and authentication of links belong to the
//! transport, not to this crate.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::NodeId;

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Send one frame to a directly connected peer. Resolves once the
    /// transport has accepted the frame and can take the next one.
    async fn send(&self, to: &NodeId, frame: Vec<u8>) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(NodeId),
    Disconnected(NodeId),
    Message { from: NodeId, frame: Vec<u8> },
}
