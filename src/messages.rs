//! # Wire Protocol Messages
//!
//! Every peer-to-peer message is a single frame:
//!
//! ```text
//! +-----------+-----------+------------------------------+
//! | size: u16 | type: u16 | body (bincode, big endian)   |
//! +-----------+-----------+------------------------------+
//! ```
//!
//! `size` covers the whole frame including the 4-byte header. Bodies use
//! fixed-width big-endian integers; a trail is a `u64` count followed by that
//! many 32-byte ids, so a body's length is always its fixed part plus
//! `count * 32` per trail.
//!
//! ## Message Types
//!
//! | Type | Message | Routed by |
//! |------|---------|-----------|
//! | 1 | `Put` | best-known destination, re-resolved per hop |
//! | 2 | `Get` | best-known destination, re-resolved per hop |
//! | 3 | `GetResult` | reversed `get_path` |
//! | 4 | `TrailSetup` | best-known destination, re-resolved per hop |
//! | 5 | `TrailSetupResult` | reversed trail |
//! | 6 | `VerifySuccessor` | routing table, source to destination |
//! | 7 | `VerifySuccessorResult` | routing table, destination to source |
//! | 8 | `NotifyNewSuccessor` | embedded trail |
//! | 9 | `TrailRejected` | previous hop |
//! | 10 | `TrailTeardown` | routing table, either direction |
//! | 11 | `AddTrail` | embedded trail |
//! | 12 | `TrailCompression` | routing table, source to destination |
//!
//! ## Security Limits
//!
//! - Decoding rejects any frame whose declared size differs from its length.
//! - Bodies must be consumed exactly; trailing bytes are an error.
//! - Trails and paths are bounded and may not repeat a peer or contain their
//!   own endpoints.

use std::collections::HashSet;

use bincode::Options;
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::bloom::BloomFilter;
use crate::error::RouterError;
use crate::identity::NodeId;
use crate::store::BlockType;

/// Largest frame the 16-bit size field can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// `size` + `type`.
pub const HEADER_SIZE: usize = 4;

/// Longest trail accepted on the wire.
pub const MAX_TRAIL_LENGTH: usize = 128;

/// Longest put/get path accepted on the wire.
pub const MAX_PATH_LENGTH: usize = 256;

/// Largest PUT payload or GET result value.
pub const MAX_PAYLOAD_SIZE: usize = 48 * 1024;

/// SECURITY: bodies are decoded with the frame limit so a forged length
/// prefix cannot trigger a large allocation.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_big_endian()
        .with_fixint_encoding()
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, RouterError> {
    bincode_options()
        .serialize(body)
        .map_err(|_| RouterError::Oversized(MAX_MESSAGE_SIZE + 1))
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RouterError> {
    Ok(bincode_options().deserialize(bytes)?)
}

/// Opaque 256-bit trail identifier chosen by the node that creates the trail.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrailId([u8; 32]);

impl TrailId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for TrailId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrailId({})", self.short())
    }
}

/// Which way a message travels along a trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the node that created the trail toward its far end.
    SrcToDest,
    /// From the far end back toward the creator.
    DestToSrc,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::SrcToDest => Direction::DestToSrc,
            Direction::DestToSrc => Direction::SrcToDest,
        }
    }
}

/// Request routing flags carried by PUT and GET.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteOptions(u32);

impl RouteOptions {
    pub const NONE: RouteOptions = RouteOptions(0);
    /// Every hop stores (PUT) or answers (GET), not only the final one.
    pub const DEMULTIPLEX_EVERYWHERE: RouteOptions = RouteOptions(1);
    /// Record and expose the put/get path.
    pub const RECORD_ROUTE: RouteOptions = RouteOptions(2);
    /// GET asks for the responsible peer's HELLO.
    pub const FIND_PEER: RouteOptions = RouteOptions(4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: RouteOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RouteOptions {
    type Output = RouteOptions;

    fn bitor(self, rhs: RouteOptions) -> RouteOptions {
        RouteOptions(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Put = 1,
    Get = 2,
    GetResult = 3,
    TrailSetup = 4,
    TrailSetupResult = 5,
    VerifySuccessor = 6,
    VerifySuccessorResult = 7,
    NotifyNewSuccessor = 8,
    TrailRejected = 9,
    TrailTeardown = 10,
    AddTrail = 11,
    TrailCompression = 12,
}

impl TryFrom<u16> for MessageType {
    type Error = RouterError;

    fn try_from(raw: u16) -> Result<Self, RouterError> {
        Ok(match raw {
            1 => MessageType::Put,
            2 => MessageType::Get,
            3 => MessageType::GetResult,
            4 => MessageType::TrailSetup,
            5 => MessageType::TrailSetupResult,
            6 => MessageType::VerifySuccessor,
            7 => MessageType::VerifySuccessorResult,
            8 => MessageType::NotifyNewSuccessor,
            9 => MessageType::TrailRejected,
            10 => MessageType::TrailTeardown,
            11 => MessageType::AddTrail,
            12 => MessageType::TrailCompression,
            _ => return Err(RouterError::Malformed("unknown message type")),
        })
    }
}

/// Search for the peer closest to `target_value`, building a trail as it goes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailSetup {
    pub source: NodeId,
    pub target_value: u64,
    pub is_predecessor: bool,
    pub best_known_destination: NodeId,
    pub intermediate_trail_id: Option<TrailId>,
    pub trail_id: TrailId,
    /// Peers that forwarded the setup, excluding the source.
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailSetupResult {
    pub querying_peer: NodeId,
    pub finger_identity: NodeId,
    pub target_value: u64,
    pub is_predecessor: bool,
    pub trail_id: TrailId,
    /// Intermediates between `querying_peer` and `finger_identity`.
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailRejected {
    pub source: NodeId,
    pub target_value: u64,
    pub is_predecessor: bool,
    pub trail_id: TrailId,
    pub congestion_time_ms: u64,
    /// The setup's trail as it was when it reached the rejecting peer.
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailTeardown {
    pub trail_id: TrailId,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailCompression {
    pub source: NodeId,
    pub new_first_friend: NodeId,
    pub trail_id: TrailId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTrail {
    pub source: NodeId,
    pub destination: NodeId,
    pub trail_id: TrailId,
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySuccessor {
    pub source: NodeId,
    pub successor: NodeId,
    pub trail_id: TrailId,
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySuccessorResult {
    pub querying_peer: NodeId,
    pub current_successor: NodeId,
    pub probable_successor: NodeId,
    pub trail_id: TrailId,
    pub direction: Direction,
    /// Intermediates from `current_successor` to `probable_successor`.
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyNewSuccessor {
    pub source: NodeId,
    pub new_successor: NodeId,
    pub trail_id: TrailId,
    pub trail: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put {
    pub options: RouteOptions,
    pub block_type: BlockType,
    pub hop_count: u32,
    pub replication: u32,
    pub put_path: Vec<NodeId>,
    pub best_known_destination: NodeId,
    pub intermediate_trail_id: Option<TrailId>,
    pub expiration_ms: u64,
    pub key: NodeId,
    pub peer_filter: BloomFilter,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    pub options: RouteOptions,
    pub block_type: BlockType,
    pub hop_count: u32,
    pub replication: u32,
    /// Peers that handled the GET after the querying peer.
    pub get_path: Vec<NodeId>,
    pub best_known_destination: NodeId,
    pub intermediate_trail_id: Option<TrailId>,
    pub key: NodeId,
    pub querying_peer: NodeId,
    pub peer_filter: BloomFilter,
    pub reply_filter: BloomFilter,
    pub xquery: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResult {
    pub block_type: BlockType,
    pub put_path: Vec<NodeId>,
    pub get_path: Vec<NodeId>,
    pub querying_peer: NodeId,
    pub expiration_ms: u64,
    pub key: NodeId,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Put(Put),
    Get(Get),
    GetResult(GetResult),
    TrailSetup(TrailSetup),
    TrailSetupResult(TrailSetupResult),
    VerifySuccessor(VerifySuccessor),
    VerifySuccessorResult(VerifySuccessorResult),
    NotifyNewSuccessor(NotifyNewSuccessor),
    TrailRejected(TrailRejected),
    TrailTeardown(TrailTeardown),
    AddTrail(AddTrail),
    TrailCompression(TrailCompression),
}

impl PeerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::Put(_) => MessageType::Put,
            PeerMessage::Get(_) => MessageType::Get,
            PeerMessage::GetResult(_) => MessageType::GetResult,
            PeerMessage::TrailSetup(_) => MessageType::TrailSetup,
            PeerMessage::TrailSetupResult(_) => MessageType::TrailSetupResult,
            PeerMessage::VerifySuccessor(_) => MessageType::VerifySuccessor,
            PeerMessage::VerifySuccessorResult(_) => MessageType::VerifySuccessorResult,
            PeerMessage::NotifyNewSuccessor(_) => MessageType::NotifyNewSuccessor,
            PeerMessage::TrailRejected(_) => MessageType::TrailRejected,
            PeerMessage::TrailTeardown(_) => MessageType::TrailTeardown,
            PeerMessage::AddTrail(_) => MessageType::AddTrail,
            PeerMessage::TrailCompression(_) => MessageType::TrailCompression,
        }
    }

    /// Structural checks that need no routing state.
    pub fn validate(&self) -> Result<(), RouterError> {
        match self {
            PeerMessage::TrailSetup(m) => check_trail(&m.trail, &[m.source]),
            PeerMessage::TrailSetupResult(m) => {
                check_trail(&m.trail, &[m.querying_peer, m.finger_identity])
            }
            PeerMessage::TrailRejected(m) => check_trail(&m.trail, &[m.source]),
            PeerMessage::TrailTeardown(_) => Ok(()),
            PeerMessage::TrailCompression(m) => {
                if m.source == m.new_first_friend {
                    return Err(RouterError::Malformed("compression names its own source"));
                }
                Ok(())
            }
            PeerMessage::AddTrail(m) => check_trail(&m.trail, &[m.source, m.destination]),
            PeerMessage::VerifySuccessor(m) => check_trail(&m.trail, &[m.source, m.successor]),
            PeerMessage::VerifySuccessorResult(m) => {
                check_trail(&m.trail, &[m.current_successor, m.probable_successor])
            }
            PeerMessage::NotifyNewSuccessor(m) => {
                check_trail(&m.trail, &[m.source, m.new_successor])
            }
            PeerMessage::Put(m) => {
                check_path(&m.put_path)?;
                check_filter(&m.peer_filter)?;
                check_payload(&m.payload)
            }
            PeerMessage::Get(m) => {
                check_path(&m.get_path)?;
                check_filter(&m.peer_filter)?;
                check_filter(&m.reply_filter)
            }
            PeerMessage::GetResult(m) => {
                check_path(&m.put_path)?;
                check_path(&m.get_path)?;
                if m.get_path.is_empty() {
                    return Err(RouterError::Malformed("result without a return path"));
                }
                check_payload(&m.payload)
            }
        }
    }
}

fn check_trail(trail: &[NodeId], endpoints: &[NodeId]) -> Result<(), RouterError> {
    if trail.len() > MAX_TRAIL_LENGTH {
        return Err(RouterError::Malformed("trail too long"));
    }
    if trail.iter().any(|hop| endpoints.contains(hop)) {
        return Err(RouterError::Malformed("trail contains its own endpoint"));
    }
    let mut seen = HashSet::with_capacity(trail.len());
    if !trail.iter().all(|hop| seen.insert(*hop)) {
        return Err(RouterError::Malformed("trail repeats a peer"));
    }
    Ok(())
}

fn check_path(path: &[NodeId]) -> Result<(), RouterError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(RouterError::Malformed("path too long"));
    }
    Ok(())
}

fn check_filter(filter: &BloomFilter) -> Result<(), RouterError> {
    if !filter.is_well_formed() {
        return Err(RouterError::Malformed("bloom filter has wrong size"));
    }
    Ok(())
}

fn check_payload(payload: &[u8]) -> Result<(), RouterError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(RouterError::Malformed("payload too large"));
    }
    Ok(())
}

/// Serialize a message into a complete frame.
pub fn encode(message: &PeerMessage) -> Result<Vec<u8>, RouterError> {
    let body = match message {
        PeerMessage::Put(m) => encode_body(m)?,
        PeerMessage::Get(m) => encode_body(m)?,
        PeerMessage::GetResult(m) => encode_body(m)?,
        PeerMessage::TrailSetup(m) => encode_body(m)?,
        PeerMessage::TrailSetupResult(m) => encode_body(m)?,
        PeerMessage::VerifySuccessor(m) => encode_body(m)?,
        PeerMessage::VerifySuccessorResult(m) => encode_body(m)?,
        PeerMessage::NotifyNewSuccessor(m) => encode_body(m)?,
        PeerMessage::TrailRejected(m) => encode_body(m)?,
        PeerMessage::TrailTeardown(m) => encode_body(m)?,
        PeerMessage::AddTrail(m) => encode_body(m)?,
        PeerMessage::TrailCompression(m) => encode_body(m)?,
    };
    let total = HEADER_SIZE + body.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(RouterError::Oversized(total));
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&(message.message_type() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse and validate a frame. Nothing is mutated before this succeeds.
pub fn decode(frame: &[u8]) -> Result<PeerMessage, RouterError> {
    if frame.len() < HEADER_SIZE {
        return Err(RouterError::Malformed("frame shorter than header"));
    }
    let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if declared != frame.len() {
        return Err(RouterError::Malformed("declared size does not match frame length"));
    }
    let kind = MessageType::try_from(u16::from_be_bytes([frame[2], frame[3]]))?;
    let body = &frame[HEADER_SIZE..];
    let message = match kind {
        MessageType::Put => PeerMessage::Put(decode_body(body)?),
        MessageType::Get => PeerMessage::Get(decode_body(body)?),
        MessageType::GetResult => PeerMessage::GetResult(decode_body(body)?),
        MessageType::TrailSetup => PeerMessage::TrailSetup(decode_body(body)?),
        MessageType::TrailSetupResult => PeerMessage::TrailSetupResult(decode_body(body)?),
        MessageType::VerifySuccessor => PeerMessage::VerifySuccessor(decode_body(body)?),
        MessageType::VerifySuccessorResult => {
            PeerMessage::VerifySuccessorResult(decode_body(body)?)
        }
        MessageType::NotifyNewSuccessor => PeerMessage::NotifyNewSuccessor(decode_body(body)?),
        MessageType::TrailRejected => PeerMessage::TrailRejected(decode_body(body)?),
        MessageType::TrailTeardown => PeerMessage::TrailTeardown(decode_body(body)?),
        MessageType::AddTrail => PeerMessage::AddTrail(decode_body(body)?),
        MessageType::TrailCompression => PeerMessage::TrailCompression(decode_body(body)?),
    };
    message.validate()?;
    Ok(message)
}
