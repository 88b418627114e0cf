//! # Node Identity
//!
//! Every node is named by a 32-byte [`NodeId`], which is the node's Ed25519
//! public key. Finger arithmetic does not use the full 256 bits: it works on
//! the **ring value**, the first 8 bytes read big-endian, so the ring is
//! `Z / 2^64`.
//!
//! | Type | Role |
//! |------|------|
//! | [`NodeId`] | Peer identifier and DHT key |
//! | [`Keypair`] | Ed25519 key material a node derives its id from |
//! | [`Contact`] | Identity plus dialable addresses (HELLO payload) |
//!
//! Keys stored in the DHT live in the same space as node ids; [`key_for`]
//! hashes arbitrary bytes into it.

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of the identifier space in bits.
pub const ID_BITS: u32 = 256;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Content-addressed key for a byte string (BLAKE3).
pub fn key_for(data: &[u8]) -> NodeId {
    NodeId::from_bytes(*blake3::hash(data).as_bytes())
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Projection of this id onto the 64-bit finger ring.
    #[inline]
    pub fn ring_value(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    /// An id whose ring projection is `value` and whose tail is zero.
    pub fn from_ring_value(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Bit `index` counted from the most significant bit.
    #[inline]
    pub fn bit(&self, index: u32) -> bool {
        let byte = self.0[(index / 8) as usize];
        (byte >> (7 - (index % 8))) & 1 == 1
    }

    /// First 8 bytes in hex, the form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for NodeId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 32] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Used by the simulator so
    /// runs with the same seed produce the same ring.
    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(self.public_key_bytes())
    }

    pub fn contact(&self, addrs: Vec<String>) -> Contact {
        Contact::new(self.node_id(), addrs)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().short())
            .finish_non_exhaustive()
    }
}

/// Reachability record for a node; the payload of a HELLO block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: NodeId,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(identity: NodeId, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    pub fn single(identity: NodeId, addr: impl Into<String>) -> Self {
        Self::new(identity, vec![addr.into()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}
