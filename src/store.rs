//! # Content Store and Block Validation
//!
//! The router consumes two narrow interfaces:
//!
//! - [`ContentStore`]: key/value records with per-record expiration. The
//!   bundled [`LocalStore`] keeps them in an LRU cache bounded by key count
//!   and sweeps expired records periodically.
//! - [`BlockValidator`]: decides whether a request is well formed and whether
//!   a candidate reply is acceptable, a duplicate, or garbage. The bundled
//!   [`DefaultValidator`] knows the built-in [`BlockType`]s.
//!
//! ## Block Types
//!
//! | Type | Wire | Rule |
//! |------|------|------|
//! | `Any` | 0 | wildcard for GET only, never stored |
//! | `Data` | 1 | `key == blake3(value)`, one result |
//! | `Hello` | 7 | value decodes as a `Contact` for `key`, one result |
//! | `Test` | 8 | anything, many results, `xquery` is a value prefix |

use std::num::NonZeroUsize;

use bincode::Options;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::error::StoreError;
use crate::identity::{Contact, NodeId, key_for, now_ms};
use crate::messages::MAX_PAYLOAD_SIZE;
use crate::metric;

/// Distinct values kept under one key.
const MAX_VALUES_PER_KEY: usize = 32;

/// How often the expiry sweep runs.
const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// SECURITY: HELLO payloads are decoded with a hard cap.
const MAX_HELLO_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum BlockType {
    Any,
    Data,
    Hello,
    Test,
    Other(u32),
}

impl From<u32> for BlockType {
    fn from(raw: u32) -> Self {
        match raw {
            0 => BlockType::Any,
            1 => BlockType::Data,
            7 => BlockType::Hello,
            8 => BlockType::Test,
            other => BlockType::Other(other),
        }
    }
}

impl From<BlockType> for u32 {
    fn from(block_type: BlockType) -> Self {
        match block_type {
            BlockType::Any => 0,
            BlockType::Data => 1,
            BlockType::Hello => 7,
            BlockType::Test => 8,
            BlockType::Other(raw) => raw,
        }
    }
}

impl BlockType {
    /// Whether a stored record of type `stored` answers a query for `self`.
    pub fn matches(self, stored: BlockType) -> bool {
        self == BlockType::Any || self == stored
    }
}

pub fn value_hash(value: &[u8]) -> blake3::Hash {
    blake3::hash(value)
}

fn hello_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_HELLO_SIZE)
        .with_big_endian()
        .with_fixint_encoding()
}

/// HELLO block payload for `contact`.
pub fn encode_hello(contact: &Contact) -> Vec<u8> {
    hello_options().serialize(contact).unwrap_or_default()
}

pub fn decode_hello(bytes: &[u8]) -> Option<Contact> {
    hello_options().deserialize(bytes).ok()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub block_type: BlockType,
    /// Absolute expiration in ms since the epoch; 0 never expires.
    pub expiration_ms: u64,
    pub put_path: Vec<NodeId>,
}

impl Record {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_ms != 0 && self.expiration_ms <= now_ms
    }
}

/// Per-PUT metadata a store may use for placement and eviction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PutMeta {
    pub priority: u32,
    pub anonymity: u32,
    pub replication: u32,
}

pub trait ContentStore: Send {
    fn put(&mut self, record: Record, meta: PutMeta) -> Result<(), StoreError>;

    /// Unexpired records under `key` matching `block_type`, skipping the
    /// first `cursor` matches.
    fn get_by_key(&mut self, key: &NodeId, block_type: BlockType, cursor: u64) -> Vec<Record>;

    /// Up to `limit` records whose keys are closest to `key`.
    fn get_closest(&mut self, key: &NodeId, limit: u32) -> Vec<Record>;

    fn remove(&mut self, key: &NodeId, value_hash: &blake3::Hash) -> bool;

    /// Number of records held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of capacity in use, `0.0..=1.0`.
    fn utilization(&self) -> f32;
}

#[derive(Clone, Debug)]
struct StoredRecord {
    record: Record,
    hash: blake3::Hash,
    meta: PutMeta,
}

/// In-memory store with LRU eviction by key.
pub struct LocalStore {
    cache: LruCache<NodeId, Vec<StoredRecord>>,
    capacity: usize,
    records: usize,
    last_expiration_check: Instant,
}

impl LocalStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            capacity,
            records: 0,
            last_expiration_check: Instant::now(),
        }
    }

    /// Remove expired records from the cache.
    fn maybe_expire_entries(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_expiration_check) < EXPIRATION_CHECK_INTERVAL {
            return;
        }
        self.last_expiration_check = now;
        self.expire_now(now_ms());
    }

    fn expire_now(&mut self, now: u64) {
        let keys: Vec<NodeId> = self.cache.iter().map(|(key, _)| *key).collect();
        let mut expired = 0;
        for key in keys {
            let Some(bucket) = self.cache.peek_mut(&key) else { continue };
            let before = bucket.len();
            bucket.retain(|stored| !stored.record.is_expired(now));
            expired += before - bucket.len();
            if bucket.is_empty() {
                self.cache.pop(&key);
            }
        }
        if expired > 0 {
            self.records -= expired;
            debug!(expired_count = expired, "removing expired records");
        }
    }
}

impl ContentStore for LocalStore {
    fn put(&mut self, record: Record, meta: PutMeta) -> Result<(), StoreError> {
        self.maybe_expire_entries();
        if record.block_type == BlockType::Any {
            return Err(StoreError::UnstorableType);
        }
        if record.value.len() > MAX_PAYLOAD_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: record.value.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if record.is_expired(now_ms()) {
            return Err(StoreError::Expired);
        }

        let hash = value_hash(&record.value);
        let key = record.key;
        if let Some(bucket) = self.cache.get_mut(&key) {
            if let Some(existing) = bucket
                .iter_mut()
                .find(|s| s.hash == hash && s.record.block_type == record.block_type)
            {
                if record.expiration_ms == 0 || record.expiration_ms > existing.record.expiration_ms {
                    existing.record.expiration_ms = record.expiration_ms;
                }
                existing.meta = meta;
                return Ok(());
            }
            bucket.push(StoredRecord { record, hash, meta });
            self.records += 1;
            if bucket.len() > MAX_VALUES_PER_KEY {
                // Drop the record closest to expiring; 0 means never.
                if let Some(pos) = bucket
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| match s.record.expiration_ms {
                        0 => u64::MAX,
                        t => t,
                    })
                    .map(|(pos, _)| pos)
                {
                    bucket.remove(pos);
                    self.records -= 1;
                }
            }
            return Ok(());
        }

        if let Some((evicted_key, evicted)) = self.cache.push(key, vec![StoredRecord { record, hash, meta }])
            && evicted_key != key
        {
            self.records -= evicted.len();
            debug!(key = %evicted_key.short(), records = evicted.len(), "evicted least recently used key");
        }
        self.records += 1;
        Ok(())
    }

    fn get_by_key(&mut self, key: &NodeId, block_type: BlockType, cursor: u64) -> Vec<Record> {
        self.maybe_expire_entries();
        let now = now_ms();
        let Some(bucket) = self.cache.get(key) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter(|s| block_type.matches(s.record.block_type) && !s.record.is_expired(now))
            .skip(cursor as usize)
            .map(|s| s.record.clone())
            .collect()
    }

    fn get_closest(&mut self, key: &NodeId, limit: u32) -> Vec<Record> {
        let now = now_ms();
        let mut keys: Vec<(u32, NodeId)> = self
            .cache
            .iter()
            .map(|(stored_key, _)| (metric::distance(key, stored_key), *stored_key))
            .collect();
        keys.sort_unstable();
        let mut out = Vec::new();
        for (_, stored_key) in keys {
            let Some(bucket) = self.cache.peek(&stored_key) else { continue };
            for stored in bucket.iter().filter(|s| !s.record.is_expired(now)) {
                if out.len() >= limit as usize {
                    return out;
                }
                out.push(stored.record.clone());
            }
        }
        out
    }

    fn remove(&mut self, key: &NodeId, hash: &blake3::Hash) -> bool {
        let Some(bucket) = self.cache.peek_mut(key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|s| s.hash != *hash);
        let removed = before - bucket.len();
        if bucket.is_empty() {
            self.cache.pop(key);
        }
        self.records -= removed;
        removed > 0
    }

    fn len(&self) -> usize {
        self.records
    }

    fn utilization(&self) -> f32 {
        self.cache.len() as f32 / self.capacity as f32
    }
}

/// Outcome of validating a request or a candidate reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluationResult {
    /// Request (no reply data) is well formed.
    RequestValid,
    /// Valid reply; no further replies are needed.
    Accept,
    /// Valid reply; more may follow.
    AcceptMore,
    /// Valid reply the querier already has.
    Duplicate,
    /// Reply or request is malformed for its type.
    Invalid,
    /// Valid block that does not answer this query.
    Irrelevant,
    TypeUnsupported,
}

impl EvaluationResult {
    pub fn is_accepted(self) -> bool {
        matches!(self, EvaluationResult::Accept | EvaluationResult::AcceptMore)
    }
}

pub trait BlockValidator: Send {
    fn evaluate(
        &self,
        block_type: BlockType,
        key: &NodeId,
        reply_filter: Option<&BloomFilter>,
        xquery: &[u8],
        data: Option<&[u8]>,
    ) -> EvaluationResult;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultValidator;

impl BlockValidator for DefaultValidator {
    fn evaluate(
        &self,
        block_type: BlockType,
        key: &NodeId,
        reply_filter: Option<&BloomFilter>,
        xquery: &[u8],
        data: Option<&[u8]>,
    ) -> EvaluationResult {
        let Some(data) = data else {
            return match block_type {
                BlockType::Other(_) => EvaluationResult::TypeUnsupported,
                BlockType::Test => EvaluationResult::RequestValid,
                _ if xquery.is_empty() => EvaluationResult::RequestValid,
                _ => EvaluationResult::Invalid,
            };
        };

        let verdict = match block_type {
            BlockType::Any => EvaluationResult::Invalid,
            BlockType::Other(_) => EvaluationResult::TypeUnsupported,
            BlockType::Data => {
                if key_for(data) == *key {
                    EvaluationResult::Accept
                } else {
                    EvaluationResult::Invalid
                }
            }
            BlockType::Hello => match decode_hello(data) {
                Some(contact) if contact.identity == *key => EvaluationResult::Accept,
                _ => EvaluationResult::Invalid,
            },
            BlockType::Test => {
                if xquery.is_empty() || data.starts_with(xquery) {
                    EvaluationResult::AcceptMore
                } else {
                    EvaluationResult::Irrelevant
                }
            }
        };
        if verdict.is_accepted()
            && reply_filter.is_some_and(|filter| filter.test(value_hash(data).as_bytes()))
        {
            return EvaluationResult::Duplicate;
        }
        verdict
    }
}
