//! # DHT Node
//!
//! [`DhtNode`] is the public handle to a running node. It is cheap to clone
//! and talks to a private actor over a command channel; the actor owns the
//! [`Router`] and is the only task that touches routing state.
//!
//! ```text
//!   DhtNode (handle) ──Command──▶ DhtNodeActor ──▶ Router
//!                                    ▲      │
//!              TransportEvent ───────┘      └──▶ PeerTransport::send (one per friend)
//! ```
//!
//! Timers run as small spawned tasks that post commands to the actor and
//! stop as soon as the actor is gone:
//!
//! | Timer | Period |
//! |-------|--------|
//! | finger search | randomized, `find_peer_min_interval..=find_peer_max_interval` |
//! | successor verification | `verify_successor_interval` |
//! | round expiry | `trail_setup_timeout` |
//!
//! Each friend has at most one frame in flight; the next is taken from the
//! router's queue only after the transport reports the previous one sent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::error::RouterError;
use crate::identity::{Contact, NodeId};
use crate::messages::RouteOptions;
use crate::metric::{self, Closeness};
use crate::protocols::{PeerTransport, TransportEvent};
use crate::requests::{GetRequest, PutRequest};
use crate::router::{FingerSummary, GetReply, Router, RouterEvent, SearchId, TelemetrySnapshot};
use crate::store::{BlockType, decode_hello};

/// Command channel depth between handles and the actor.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

type SearchStarted = Result<(SearchId, oneshot::Receiver<()>), RouterError>;

#[derive(Clone)]
pub struct DhtNode {
    cmd_tx: mpsc::Sender<Command>,
    contact: Contact,
    config: DhtConfig,
}

struct DhtNodeActor<T: PeerTransport> {
    router: Router,
    transport: Arc<T>,
    events: mpsc::Receiver<TransportEvent>,
    events_open: bool,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    in_flight: HashSet<NodeId>,
    waiters: HashMap<SearchId, oneshot::Sender<()>>,
}

enum Command {
    // Timers
    FindFingerTick(oneshot::Sender<Duration>),
    VerifySuccessor,
    ExpireRounds,
    TransmitReady(NodeId),

    // Client operations
    Put(PutRequest, oneshot::Sender<Result<(), RouterError>>),
    StartGet(GetRequest, oneshot::Sender<SearchStarted>),
    FinishGet(SearchId, oneshot::Sender<Vec<GetReply>>),

    // Queries
    Telemetry(oneshot::Sender<TelemetrySnapshot>),
    Fingers(oneshot::Sender<Vec<FingerSummary>>),

    Quit,
}

impl DhtNode {
    /// Start a node on `transport`, consuming its event stream.
    pub fn spawn<T: PeerTransport>(
        contact: Contact,
        config: DhtConfig,
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = DhtNodeActor {
            router: Router::with_defaults(contact.clone(), config.clone()),
            transport: Arc::new(transport),
            events,
            events_open: true,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            in_flight: HashSet::new(),
            waiters: HashMap::new(),
        };
        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            contact,
            config,
        };
        node.spawn_finger_search_timer();
        node.spawn_periodic(node.config.verify_successor_interval, || Command::VerifySuccessor);
        node.spawn_periodic(node.config.trail_setup_timeout, || Command::ExpireRounds);
        info!(id = %node.contact.identity.short(), "dht node started");
        Ok(node)
    }

    pub fn identity(&self) -> NodeId {
        self.contact.identity
    }

    pub fn contact(&self) -> Contact {
        self.contact.clone()
    }

    fn spawn_finger_search_timer(&self) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                let (tx, rx) = oneshot::channel();
                if cmd_tx.send(Command::FindFingerTick(tx)).await.is_err() {
                    break;
                }
                let delay = match rx.await {
                    Ok(delay) => delay,
                    Err(_) => break,
                };
                tokio::time::sleep(delay).await;
            }
        });
    }

    fn spawn_periodic(&self, period: Duration, make: fn() -> Command) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if cmd_tx.send(make()).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("dht node has stopped"))?;
        rx.await.map_err(|_| anyhow!("dht node dropped the request"))
    }

    /// Store a value at the peer closest to `request.key`.
    pub async fn put(&self, request: PutRequest) -> Result<()> {
        self.request(|tx| Command::Put(request, tx)).await??;
        Ok(())
    }

    /// Search for `request.key`, waiting up to the configured GET timeout
    /// for a unique answer. Returns whatever arrived by then.
    pub async fn get(&self, request: GetRequest) -> Result<Vec<GetReply>> {
        let (search, done) = self.request(|tx| Command::StartGet(request, tx)).await??;
        if tokio::time::timeout(self.config.get_timeout, done).await.is_err() {
            debug!(search = search.0, "get timed out, returning partial results");
        }
        self.request(|tx| Command::FinishGet(search, tx)).await
    }

    /// Contact of the peer responsible for `target`, if any answered.
    pub async fn find_peer(&self, target: NodeId) -> Result<Option<Contact>> {
        let replies = self
            .get(GetRequest {
                key: target,
                block_type: BlockType::Hello,
                options: RouteOptions::FIND_PEER,
                replication: 1,
                xquery: Vec::new(),
            })
            .await?;
        let best = replies
            .iter()
            .filter_map(|reply| decode_hello(&reply.value))
            .min_by(|a, b| {
                metric::compare(target.ring_value(), Closeness::Successor, &a.identity, &b.identity)
            });
        Ok(best)
    }

    pub async fn telemetry(&self) -> Result<TelemetrySnapshot> {
        self.request(Command::Telemetry).await
    }

    pub async fn fingers(&self) -> Result<Vec<FingerSummary>> {
        self.request(Command::Fingers).await
    }

    /// Tear down our trails and stop the actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<T: PeerTransport> DhtNodeActor<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("transport event stream closed");
                        self.events_open = false;
                    }
                },
            }
            self.drain_router_events();
            self.flush();
        }

        self.router.shutdown();
        self.flush_all();
        info!(id = %self.router.node_id().short(), "dht node stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::FindFingerTick(reply) => {
                let delay = self.router.on_find_finger_tick();
                let _ = reply.send(delay);
            }
            Command::VerifySuccessor => self.router.on_verify_successor_tick(),
            Command::ExpireRounds => {
                self.router.expire_rounds();
            }
            Command::TransmitReady(peer) => {
                self.in_flight.remove(&peer);
            }
            Command::Put(request, reply) => {
                let _ = reply.send(self.router.put(request));
            }
            Command::StartGet(request, reply) => {
                let started = self.router.start_get(request).map(|search| {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.insert(search, tx);
                    (search, rx)
                });
                let _ = reply.send(started);
            }
            Command::FinishGet(search, reply) => {
                self.waiters.remove(&search);
                let _ = reply.send(self.router.finish_get(search));
            }
            Command::Telemetry(reply) => {
                let _ = reply.send(self.router.telemetry());
            }
            Command::Fingers(reply) => {
                let _ = reply.send(self.router.finger_summaries());
            }
            Command::Quit => {}
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => {
                if self.router.on_peer_connected(peer) {
                    // First friend: look for fingers right away.
                    let _ = self.router.on_find_finger_tick();
                }
            }
            TransportEvent::Disconnected(peer) => {
                self.router.on_peer_disconnected(&peer);
                self.in_flight.remove(&peer);
            }
            TransportEvent::Message { from, frame } => self.router.on_message(from, &frame),
        }
    }

    fn drain_router_events(&mut self) {
        for event in self.router.take_events() {
            match event {
                RouterEvent::SearchComplete(search) => {
                    if let Some(waiter) = self.waiters.remove(&search) {
                        let _ = waiter.send(());
                    }
                }
                RouterEvent::SuccessorChanged { .. } => {}
            }
        }
    }

    /// Send everything still queued, in order per friend. Used on shutdown
    /// when no further `TransmitReady` will be processed.
    fn flush_all(&mut self) {
        for peer in self.router.peers_with_pending() {
            let mut frames = Vec::new();
            while let Some(frame) = self.router.next_frame(&peer) {
                frames.push(frame);
            }
            let transport = self.transport.clone();
            tokio::spawn(async move {
                for frame in frames {
                    if let Err(e) = transport.send(&peer, frame).await {
                        debug!(peer = %peer.short(), error = %e, "final frame not sent");
                        break;
                    }
                }
            });
        }
    }

    /// Hand one queued frame to the transport for every idle friend.
    fn flush(&mut self) {
        for peer in self.router.peers_with_pending() {
            if self.in_flight.contains(&peer) {
                continue;
            }
            let Some(frame) = self.router.next_frame(&peer) else {
                continue;
            };
            self.in_flight.insert(peer);
            let transport = self.transport.clone();
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(&peer, frame).await {
                    warn!(peer = %peer.short(), error = %e, "frame send failed");
                }
                let _ = cmd_tx.send(Command::TransmitReady(peer)).await;
            });
        }
    }
}
