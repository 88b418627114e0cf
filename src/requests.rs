//! # Request Routing
//!
//! PUT and GET travel toward the peer whose ring value most closely
//! succeeds the key, using the same next-hop resolution as trail setup.
//! Each hop adds itself to the message's peer Bloom filter so no peer is
//! visited twice.
//!
//! | Message | Per hop | At the closest peer |
//! |---------|---------|---------------------|
//! | `Put` | records itself in `put_path` with `RECORD_ROUTE`; stores with `DEMULTIPLEX_EVERYWHERE` | stores, then hands `replication - 1` copies to its successor |
//! | `Get` | appends itself to `get_path`; answers from its own store | answers; with `FIND_PEER` also returns its own HELLO |
//! | `GetResult` | walks `get_path` backwards, caching what it carries | (delivered to the querying peer) |
//!
//! Paths never include the originating peer; a result's return path ends
//! at `querying_peer`.

use rand::Rng;
use tracing::{debug, trace};

use crate::bloom::BloomFilter;
use crate::config::MAXIMUM_REPLICATION_LEVEL;
use crate::error::{RouterError, StoreError};
use crate::friends::Importance;
use crate::identity::{NodeId, now_ms};
use crate::messages::{Get, GetResult, MAX_PAYLOAD_SIZE, PeerMessage, Put, RouteOptions, TrailId};
use crate::metric::Closeness;
use crate::router::{GetReply, NextHop, Router, RouterEvent, Search, SearchId};
use crate::store::{
    BlockType, EvaluationResult, PutMeta, Record, decode_hello, encode_hello, value_hash,
};

/// Cached HELLOs returned alongside our own for a `FIND_PEER` request.
const FIND_PEER_EXTRA_HELLOS: u32 = 4;

/// Parameters of a PUT issued by this node.
#[derive(Clone, Debug)]
pub struct PutRequest {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub block_type: BlockType,
    pub options: RouteOptions,
    pub replication: u32,
    /// Absolute expiration in ms since the epoch; 0 never expires.
    pub expiration_ms: u64,
}

/// Parameters of a GET issued by this node.
#[derive(Clone, Debug)]
pub struct GetRequest {
    pub key: NodeId,
    pub block_type: BlockType,
    pub options: RouteOptions,
    pub replication: u32,
    pub xquery: Vec<u8>,
}

fn clamp_replication(replication: u32) -> u32 {
    replication.clamp(1, MAXIMUM_REPLICATION_LEVEL)
}

impl Router {
    /// Store `request.value` under `request.key` at the peer closest to it.
    pub fn put(&mut self, request: PutRequest) -> Result<(), RouterError> {
        if request.value.len() > MAX_PAYLOAD_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: request.value.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }
        if request.block_type == BlockType::Any {
            return Err(StoreError::UnstorableType.into());
        }
        if request.expiration_ms != 0 && request.expiration_ms <= now_ms() {
            return Err(StoreError::Expired.into());
        }
        let msg = Put {
            options: request.options,
            block_type: request.block_type,
            hop_count: 0,
            replication: clamp_replication(request.replication),
            put_path: Vec::new(),
            best_known_destination: self.me,
            intermediate_trail_id: None,
            expiration_ms: request.expiration_ms,
            key: request.key,
            peer_filter: BloomFilter::with_mutator(rand::thread_rng().r#gen()),
            payload: request.value,
        };
        self.handle_put(None, msg)
    }

    /// Start a search. Results accumulate until [`Router::finish_get`].
    pub fn start_get(&mut self, request: GetRequest) -> Result<SearchId, RouterError> {
        let verdict = self
            .validator
            .evaluate(request.block_type, &request.key, None, &request.xquery, None);
        if verdict != EvaluationResult::RequestValid {
            return Err(RouterError::Malformed("request rejected by block validator"));
        }
        let id = SearchId(self.next_search_id);
        self.next_search_id += 1;
        let reply_filter = BloomFilter::with_mutator(rand::thread_rng().r#gen());
        self.searches.insert(
            id,
            Search {
                key: request.key,
                block_type: request.block_type,
                options: request.options,
                xquery: request.xquery.clone(),
                reply_filter: reply_filter.clone(),
                results: Vec::new(),
                done: false,
            },
        );
        let msg = Get {
            options: request.options,
            block_type: request.block_type,
            hop_count: 0,
            replication: clamp_replication(request.replication),
            get_path: Vec::new(),
            best_known_destination: self.me,
            intermediate_trail_id: None,
            key: request.key,
            querying_peer: self.me,
            peer_filter: BloomFilter::with_mutator(rand::thread_rng().r#gen()),
            reply_filter,
            xquery: request.xquery,
        };
        self.handle_get(None, msg)?;
        Ok(id)
    }

    /// Look up the contact of the peer closest to `target`.
    pub fn start_find_peer(&mut self, target: NodeId) -> Result<SearchId, RouterError> {
        self.start_get(GetRequest {
            key: target,
            block_type: BlockType::Hello,
            options: RouteOptions::FIND_PEER,
            replication: 1,
            xquery: Vec::new(),
        })
    }

    pub fn search_results(&self, id: SearchId) -> Option<&[GetReply]> {
        self.searches.get(&id).map(|s| s.results.as_slice())
    }

    /// Stop a search and return what it collected.
    pub fn finish_get(&mut self, id: SearchId) -> Vec<GetReply> {
        self.searches.remove(&id).map(|s| s.results).unwrap_or_default()
    }

    /// Closest next hop for a request keyed on `key`, avoiding peers in
    /// `peer_filter`.
    fn request_next_hop(
        &self,
        key: &NodeId,
        best_known_destination: NodeId,
        intermediate_trail_id: Option<TrailId>,
        peer_filter: &BloomFilter,
    ) -> NextHop {
        let carried = (best_known_destination != self.me)
            .then_some((best_known_destination, intermediate_trail_id));
        let skip = |peer: &NodeId| peer_filter.contains_peer(peer);
        self.find_best_destination(key.ring_value(), Closeness::Successor, carried, &skip, false)
    }

    fn check_hops(&self, hop_count: u32) -> Result<(), RouterError> {
        if hop_count > self.config.max_hops {
            return Err(RouterError::HopLimit(hop_count));
        }
        Ok(())
    }

    pub(crate) fn handle_put(&mut self, from: Option<NodeId>, mut msg: Put) -> Result<(), RouterError> {
        if from.is_some() {
            msg.hop_count += 1;
            self.check_hops(msg.hop_count)?;
            if msg.options.contains(RouteOptions::RECORD_ROUTE) {
                msg.put_path.push(self.me);
            }
        }
        msg.replication = clamp_replication(msg.replication);
        msg.peer_filter.insert_peer(&self.me);

        let hop = self.request_next_hop(
            &msg.key,
            msg.best_known_destination,
            msg.intermediate_trail_id,
            &msg.peer_filter,
        );
        let closest = hop.destination == self.me;
        if closest || msg.options.contains(RouteOptions::DEMULTIPLEX_EVERYWHERE) {
            self.store_put(&msg);
        }

        if !closest {
            trace!(key = %msg.key.short(), next = %hop.next_hop.short(), hops = msg.hop_count, "forwarding put");
            msg.best_known_destination = hop.destination;
            msg.intermediate_trail_id = hop.trail_id;
            self.send(hop.next_hop, PeerMessage::Put(msg), Importance::Normal);
            return Ok(());
        }

        if msg.replication > 1
            && let Some(successor) = self.fingers.successor()
            && !msg.peer_filter.contains_peer(&successor.identity)
            && let Some(trail) = successor.shortest_trail()
        {
            let next_hop = trail.first_hop(&successor.identity);
            debug!(
                key = %msg.key.short(),
                replica = %successor.identity.short(),
                remaining = msg.replication - 1,
                "replicating put to successor"
            );
            msg.replication -= 1;
            msg.best_known_destination = successor.identity;
            msg.intermediate_trail_id = (!trail.is_empty()).then_some(trail.id);
            self.send(next_hop, PeerMessage::Put(msg), Importance::Normal);
        }
        Ok(())
    }

    fn store_put(&mut self, msg: &Put) {
        let verdict = self.validator.evaluate(
            msg.block_type,
            &msg.key,
            None,
            &[],
            Some(&msg.payload),
        );
        if !verdict.is_accepted() {
            debug!(key = %msg.key.short(), verdict = ?verdict, "refusing to store invalid block");
            return;
        }
        let record = Record {
            key: msg.key,
            value: msg.payload.clone(),
            block_type: msg.block_type,
            expiration_ms: msg.expiration_ms,
            put_path: msg.put_path.clone(),
        };
        let meta = PutMeta {
            replication: msg.replication,
            ..PutMeta::default()
        };
        match self.store.put(record, meta) {
            Ok(()) => {
                self.stats.records_stored += 1;
                trace!(key = %msg.key.short(), "record stored");
            }
            Err(e) => debug!(key = %msg.key.short(), error = %e, "store refused record"),
        }
    }

    pub(crate) fn handle_get(&mut self, from: Option<NodeId>, mut msg: Get) -> Result<(), RouterError> {
        if from.is_some() {
            msg.hop_count += 1;
            self.check_hops(msg.hop_count)?;
            msg.get_path.push(self.me);
            let verdict = self.validator.evaluate(msg.block_type, &msg.key, None, &msg.xquery, None);
            if verdict != EvaluationResult::RequestValid {
                return Err(RouterError::Malformed("request rejected by block validator"));
            }
        }
        msg.peer_filter.insert_peer(&self.me);

        if self.answer_from_store(&mut msg) {
            trace!(key = %msg.key.short(), "get satisfied locally");
            return Ok(());
        }

        let hop = self.request_next_hop(
            &msg.key,
            msg.best_known_destination,
            msg.intermediate_trail_id,
            &msg.peer_filter,
        );
        if hop.destination == self.me {
            if msg.options.contains(RouteOptions::FIND_PEER) {
                self.answer_find_peer(&msg);
            }
            trace!(key = %msg.key.short(), hops = msg.hop_count, "get reached closest peer");
            return Ok(());
        }
        msg.best_known_destination = hop.destination;
        msg.intermediate_trail_id = hop.trail_id;
        self.send(hop.next_hop, PeerMessage::Get(msg), Importance::Normal);
        Ok(())
    }

    /// Answer from the local store. Returns true when an answer was unique
    /// and the request need not travel further.
    fn answer_from_store(&mut self, msg: &mut Get) -> bool {
        let records = self.store.get_by_key(&msg.key, msg.block_type, 0);
        for record in records {
            let verdict = self.validator.evaluate(
                record.block_type,
                &msg.key,
                Some(&msg.reply_filter),
                &msg.xquery,
                Some(&record.value),
            );
            if !verdict.is_accepted() {
                continue;
            }
            msg.reply_filter.insert(value_hash(&record.value).as_bytes());
            self.send_result(
                msg,
                GetResult {
                    block_type: record.block_type,
                    put_path: record.put_path,
                    get_path: msg.get_path.clone(),
                    querying_peer: msg.querying_peer,
                    expiration_ms: record.expiration_ms,
                    key: msg.key,
                    payload: record.value,
                },
            );
            if verdict == EvaluationResult::Accept {
                return true;
            }
        }
        false
    }

    /// Closest peer for a `FIND_PEER`: return a few cached HELLOs near the
    /// target, then our own.
    fn answer_find_peer(&mut self, msg: &Get) {
        let cached: Vec<Record> = self
            .store
            .get_closest(&msg.key, FIND_PEER_EXTRA_HELLOS + 1)
            .into_iter()
            .filter(|r| r.block_type == BlockType::Hello && r.key != self.me)
            .take(FIND_PEER_EXTRA_HELLOS as usize)
            .collect();
        for record in cached {
            if msg.reply_filter.test(value_hash(&record.value).as_bytes()) {
                continue;
            }
            self.send_result(
                msg,
                GetResult {
                    block_type: BlockType::Hello,
                    put_path: record.put_path,
                    get_path: msg.get_path.clone(),
                    querying_peer: msg.querying_peer,
                    expiration_ms: record.expiration_ms,
                    key: msg.key,
                    payload: record.value,
                },
            );
        }
        let own = GetResult {
            block_type: BlockType::Hello,
            put_path: Vec::new(),
            get_path: msg.get_path.clone(),
            querying_peer: msg.querying_peer,
            expiration_ms: 0,
            key: msg.key,
            payload: encode_hello(&self.contact),
        };
        self.send_result(msg, own);
    }

    /// Send a result one step back toward the querier, or deliver it if we
    /// are the querier.
    fn send_result(&mut self, msg: &Get, result: GetResult) {
        if msg.querying_peer == self.me && msg.get_path.is_empty() {
            self.deliver_result(result);
            return;
        }
        let back = match msg.get_path.len() {
            0 | 1 => msg.querying_peer,
            n => msg.get_path[n - 2],
        };
        self.send(back, PeerMessage::GetResult(result), Importance::Low);
    }

    pub(crate) fn handle_get_result(&mut self, from: NodeId, msg: GetResult) -> Result<(), RouterError> {
        let Some(pos) = msg.get_path.iter().rposition(|p| *p == self.me) else {
            if msg.querying_peer != self.me {
                return Err(RouterError::Malformed("result routed through a peer not on its path"));
            }
            let expected = msg
                .get_path
                .first()
                .copied()
                .ok_or(RouterError::Malformed("result without a return path"))?;
            if from != expected {
                return Err(RouterError::UnexpectedSender { expected, actual: from });
            }
            self.deliver_result(msg);
            return Ok(());
        };
        let expected = msg
            .get_path
            .get(pos + 1)
            .copied()
            .ok_or(RouterError::Malformed("result came back to its responder"))?;
        if from != expected {
            return Err(RouterError::UnexpectedSender { expected, actual: from });
        }
        self.cache_result(&msg);
        let back = if pos == 0 {
            msg.querying_peer
        } else {
            msg.get_path[pos - 1]
        };
        self.send(back, PeerMessage::GetResult(msg), Importance::Low);
        Ok(())
    }

    /// Keep a copy of a valid block passing through.
    fn cache_result(&mut self, msg: &GetResult) {
        let key = match msg.block_type {
            BlockType::Hello => match decode_hello(&msg.payload) {
                Some(contact) => contact.identity,
                None => return,
            },
            _ => msg.key,
        };
        let verdict = self.validator.evaluate(msg.block_type, &key, None, &[], Some(&msg.payload));
        if !verdict.is_accepted() {
            return;
        }
        let record = Record {
            key,
            value: msg.payload.clone(),
            block_type: msg.block_type,
            expiration_ms: msg.expiration_ms,
            put_path: msg.put_path.clone(),
        };
        if let Err(e) = self.store.put(record, PutMeta::default()) {
            trace!(key = %key.short(), error = %e, "not caching result");
        }
    }

    fn deliver_result(&mut self, msg: GetResult) {
        let hello_identity = (msg.block_type == BlockType::Hello)
            .then(|| decode_hello(&msg.payload).map(|c| c.identity))
            .flatten();
        let responder = msg.get_path.last().copied().unwrap_or(self.me);

        for (id, search) in self.searches.iter_mut() {
            if search.done || search.key != msg.key || !search.block_type.matches(msg.block_type) {
                continue;
            }
            let find_peer = search.options.contains(RouteOptions::FIND_PEER);
            let validation_key = match (find_peer, hello_identity) {
                (true, Some(identity)) => identity,
                _ => search.key,
            };
            let verdict = self.validator.evaluate(
                msg.block_type,
                &validation_key,
                Some(&search.reply_filter),
                &search.xquery,
                Some(&msg.payload),
            );
            if !verdict.is_accepted() {
                trace!(key = %msg.key.short(), verdict = ?verdict, "result not accepted");
                continue;
            }
            search.reply_filter.insert(value_hash(&msg.payload).as_bytes());
            let record_route = search.options.contains(RouteOptions::RECORD_ROUTE);
            search.results.push(GetReply {
                key: msg.key,
                block_type: msg.block_type,
                value: msg.payload.clone(),
                expiration_ms: msg.expiration_ms,
                put_path: if record_route { msg.put_path.clone() } else { Vec::new() },
                get_path: if record_route { msg.get_path.clone() } else { Vec::new() },
            });
            self.stats.results_delivered += 1;
            // A FIND_PEER completes with the responder's own HELLO, which
            // it sends last.
            let complete = if find_peer {
                hello_identity == Some(responder)
            } else {
                verdict == EvaluationResult::Accept
            };
            if complete {
                search.done = true;
                self.events.push_back(RouterEvent::SearchComplete(*id));
            }
        }
    }
}
