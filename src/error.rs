//! Error taxonomy for the routing core.
//!
//! Handlers for peer messages return `Result<(), RouterError>`; the dispatch
//! loop logs the error and drops the message. Nothing here is ever sent back
//! to the peer that caused it.

use crate::identity::NodeId;
use crate::messages::TrailId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Frame failed to decode or carried self-contradictory fields.
    Malformed(&'static str),
    /// Message arrived from, or was addressed to, a peer that is not a friend.
    UnknownPeer(NodeId),
    /// Message arrived from a neighbour that is not the expected hop.
    UnexpectedSender { expected: NodeId, actual: NodeId },
    /// Routing entry exists with a different (prev, next) pair.
    AlreadyExists(TrailId),
    /// No routing state for a trail this hop was expected to carry.
    MissingTrail(TrailId),
    /// Ring value is neither `my + 2^i` nor `my - 1`.
    InvalidFingerValue(u64),
    /// Encoded frame exceeds the 16-bit size field.
    Oversized(usize),
    /// Hop limit exceeded.
    HopLimit(u32),
    /// Content store refused a record.
    Store(StoreError),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::Malformed(reason) => write!(f, "malformed message: {reason}"),
            RouterError::UnknownPeer(peer) => write!(f, "peer {} is not a friend", peer.short()),
            RouterError::UnexpectedSender { expected, actual } => write!(
                f,
                "message from {} where {} was expected",
                actual.short(),
                expected.short()
            ),
            RouterError::AlreadyExists(id) => {
                write!(f, "trail {} already routed through different hops", id.short())
            }
            RouterError::MissingTrail(id) => write!(f, "no routing entry for trail {}", id.short()),
            RouterError::InvalidFingerValue(value) => {
                write!(f, "ring value {value:#018x} does not name a finger slot")
            }
            RouterError::Oversized(len) => write!(f, "frame of {len} bytes exceeds size field"),
            RouterError::HopLimit(hops) => write!(f, "hop limit exceeded after {hops} hops"),
            RouterError::Store(err) => write!(f, "store rejected record: {err}"),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<StoreError> for RouterError {
    fn from(err: StoreError) -> Self {
        RouterError::Store(err)
    }
}

impl From<bincode::Error> for RouterError {
    fn from(_: bincode::Error) -> Self {
        RouterError::Malformed("body does not decode")
    }
}

/// Reasons the content store refuses a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    ValueTooLarge { size: usize, max: usize },
    Expired,
    /// The block type cannot be stored (e.g. a wildcard type).
    UnstorableType,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ValueTooLarge { size, max } => {
                write!(f, "value of {size} bytes exceeds limit of {max}")
            }
            StoreError::Expired => write!(f, "record already expired"),
            StoreError::UnstorableType => write!(f, "block type cannot be stored"),
        }
    }
}

impl std::error::Error for StoreError {}
