//! Gossip membership of synchronizer nodes
//!
//! Each node periodically pushes its live view (a heartbeat digest per
//! member) to a random fan-out of peers. A member whose heartbeat stops
//! advancing for `failure_timeout` is marked failed; failed and departed
//! members are forgotten after `reap_timeout`.
//!
//! Membership changes and user events are queued in arrival order and
//! handed to registered [`EventHandler`]s by a single delivery task.

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncer_core::types::*;
use syncer_net::gossip::{GossipMessage, MemberDigest, UserEvent, MAX_DATAGRAM};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Remembered user events per node, for duplicate suppression
const SEEN_EVENTS_CAPACITY: usize = 4096;

/// Interval between join attempts while waiting for a seed
const JOIN_RETRY: Duration = Duration::from_millis(250);

/// Digests carried by one heartbeat or join ack, ours included
const MAX_DIGESTS_PER_MESSAGE: usize = 64;

/// Membership errors
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Could not join any seed of {0:?}")]
    JoinFailed(Vec<SocketAddr>),
    #[error("Membership not started")]
    NotStarted,
    #[error("Gossip encoding error: {0}")]
    Encoding(#[from] syncer_net::gossip::GossipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiver of membership and user events
///
/// Callbacks run on the membership delivery task and must not block.
pub trait EventHandler: Send + Sync {
    fn on_member_join(&self, members: &[Node]);
    fn on_member_leave(&self, members: &[Node]);
    fn on_member_update(&self, members: &[Node]);
    fn on_user_event(&self, event: &UserEvent);
}

/// Read-only view of the overlay plus best-effort broadcast
pub trait MemberView: Send + Sync {
    fn local_node(&self) -> Node;
    fn live_members(&self) -> Vec<Node>;
    /// Best-effort, at-most-once broadcast of a user event
    fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), MembershipError>;
}

/// Membership configuration
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// This node as advertised to peers
    pub node: Node,
    pub bind_addr: SocketAddr,
    /// Gossip address advertised to peers (port 0 = use the bound port)
    pub advertise_addr: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub gossip_interval: Duration,
    pub fanout: usize,
    pub join_timeout: Duration,
    pub failure_timeout: Duration,
    pub reap_timeout: Duration,
}

#[derive(Debug)]
enum MembershipEvent {
    Join(Vec<Node>),
    Leave(Vec<Node>),
    Update(Vec<Node>),
    User(UserEvent),
}

#[derive(Debug, Clone)]
struct MemberEntry {
    digest: MemberDigest,
    last_seen: Instant,
    state_changed: Instant,
}

#[derive(Debug, Default)]
struct SeenEvents {
    order: VecDeque<(NodeId, u64)>,
    set: HashSet<(NodeId, u64)>,
}

impl SeenEvents {
    /// Record an event; false if it was already seen
    fn insert(&mut self, origin: &NodeId, sequence: u64) -> bool {
        let key = (origin.clone(), sequence);
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > SEEN_EVENTS_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Gossip membership adapter
pub struct Membership {
    config: MembershipConfig,
    /// Process start marker advertised with every digest
    incarnation: u64,
    heartbeat: AtomicU64,
    event_sequence: AtomicU64,
    advertise_addr: RwLock<SocketAddr>,
    members: RwLock<HashMap<NodeId, MemberEntry>>,
    seen_events: Mutex<SeenEvents>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    events_tx: mpsc::UnboundedSender<MembershipEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
    joined: Notify,
    left: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Membership {
    pub fn new(config: MembershipConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let advertise_addr = config.advertise_addr;
        Self {
            config,
            incarnation: now_millis(),
            heartbeat: AtomicU64::new(0),
            event_sequence: AtomicU64::new(0),
            advertise_addr: RwLock::new(advertise_addr),
            members: RwLock::new(HashMap::new()),
            seen_events: Mutex::new(SeenEvents::default()),
            handlers: RwLock::new(Vec::new()),
            socket: RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            joined: Notify::new(),
            left: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the gossip socket, start background tasks and join the overlay.
    ///
    /// An empty seed list starts a new overlay. With seeds, at least one
    /// must answer within `join_timeout`.
    pub async fn start(self: &Arc<Self>) -> Result<(), MembershipError> {
        let addr = self.config.bind_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| MembershipError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        {
            let mut advertise = self.advertise_addr.write();
            if advertise.port() == 0 {
                advertise.set_port(local_addr.port());
            }
        }
        let socket = Arc::new(socket);
        *self.socket.write() = Some(socket.clone());
        info!(
            "Gossip listening on {} as {} (cluster {})",
            local_addr, self.config.node.id, self.config.node.cluster
        );

        let mut tasks = Vec::with_capacity(3);
        tasks.push(self.spawn_receiver(socket));
        tasks.push(self.spawn_delivery());
        tasks.push(self.spawn_gossip());
        self.tasks.lock().extend(tasks);

        if self.config.seeds.is_empty() {
            info!("No seeds configured, starting a new gossip overlay");
            return Ok(());
        }
        self.join().await
    }

    async fn join(&self) -> Result<(), MembershipError> {
        let deadline = tokio::time::Instant::now() + self.config.join_timeout;
        loop {
            let join = GossipMessage::Join {
                member: self.local_digest(),
            };
            for seed in &self.config.seeds {
                if let Err(e) = self.send(&join, *seed).await {
                    debug!("Join to seed {} failed: {}", seed, e);
                }
            }

            tokio::select! {
                _ = self.joined.notified() => {
                    info!("Joined gossip overlay ({} members)", self.member_count());
                    return Ok(());
                }
                _ = tokio::time::sleep(JOIN_RETRY) => {}
            }

            if self.member_count() > 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MembershipError::JoinFailed(self.config.seeds.clone()));
            }
        }
    }

    /// Register a handler for membership and user events
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Remove a previously registered handler
    pub fn deregister_event_handler(&self, handler: &Arc<dyn EventHandler>) {
        let target = Arc::as_ptr(handler) as *const ();
        self.handlers
            .write()
            .retain(|h| Arc::as_ptr(h) as *const () != target);
    }

    /// Announce a graceful departure to every live member
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = GossipMessage::Leave {
            node: self.config.node.id.clone(),
            incarnation: self.incarnation,
        };
        let targets: Vec<SocketAddr> = self.live_entries().iter().map(|e| e.digest.gossip_addr).collect();
        for addr in &targets {
            if let Err(e) = self.send(&message, *addr).await {
                debug!("Leave to {} failed: {}", addr, e);
            }
        }
        info!("Left gossip overlay ({} members notified)", targets.len());
    }

    /// Stop all gossip tasks and release the socket
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.socket.write().take();
        info!("Gossip membership shut down");
    }

    /// Gossip address this node advertises
    pub fn advertise_addr(&self) -> SocketAddr {
        *self.advertise_addr.read()
    }

    /// All known members other than ourselves, in any state
    pub fn members(&self) -> Vec<Node> {
        self.members
            .read()
            .values()
            .map(|e| e.digest.node.clone())
            .collect()
    }

    /// Number of known members other than ourselves
    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    fn live_entries(&self) -> Vec<MemberEntry> {
        self.members
            .read()
            .values()
            .filter(|e| e.digest.node.is_alive())
            .cloned()
            .collect()
    }

    fn local_digest(&self) -> MemberDigest {
        MemberDigest {
            node: self.config.node.clone(),
            gossip_addr: self.advertise_addr(),
            incarnation: self.incarnation,
            heartbeat: self.heartbeat.load(Ordering::SeqCst),
        }
    }

    /// Our digest plus a random sample of live members, small enough for
    /// one datagram
    fn live_digests(&self) -> Vec<MemberDigest> {
        let mut digests = vec![self.local_digest()];
        let live = self.live_entries();
        let mut rng = rand::thread_rng();
        digests.extend(
            live.choose_multiple(&mut rng, MAX_DIGESTS_PER_MESSAGE - 1)
                .map(|e| e.digest.clone()),
        );
        digests
    }

    async fn send(&self, message: &GossipMessage, addr: SocketAddr) -> Result<(), MembershipError> {
        let socket = self
            .socket
            .read()
            .clone()
            .ok_or(MembershipError::NotStarted)?;
        let bytes = message.encode()?;
        socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    fn emit(&self, event: MembershipEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("Membership event dropped, delivery stopped");
        }
    }

    /// Merge received digests into our view, emitting join/update events
    fn merge_digests(&self, digests: Vec<MemberDigest>) -> usize {
        let now = Instant::now();
        let mut joined = Vec::new();
        let mut updated = Vec::new();
        {
            let mut members = self.members.write();
            for mut digest in digests {
                if digest.node.id == self.config.node.id {
                    continue;
                }
                digest.node.state = MemberState::Alive;
                match members.get_mut(&digest.node.id) {
                    None => {
                        joined.push(digest.node.clone());
                        members.insert(
                            digest.node.id.clone(),
                            MemberEntry {
                                digest,
                                last_seen: now,
                                state_changed: now,
                            },
                        );
                    }
                    Some(entry) => {
                        if !digest.supersedes(&entry.digest) {
                            continue;
                        }
                        let previous = entry.digest.node.state;
                        // heartbeats from a departed incarnation are stale gossip
                        if previous == MemberState::Left
                            && digest.incarnation == entry.digest.incarnation
                        {
                            continue;
                        }
                        let attributes_changed = entry.digest.node.rpc_addr != digest.node.rpc_addr
                            || entry.digest.node.cluster != digest.node.cluster
                            || entry.digest.node.tags != digest.node.tags;
                        entry.digest = digest;
                        entry.last_seen = now;
                        if previous != MemberState::Alive {
                            entry.state_changed = now;
                            joined.push(entry.digest.node.clone());
                        } else if attributes_changed {
                            updated.push(entry.digest.node.clone());
                        }
                    }
                }
            }
        }

        let count = joined.len();
        if !joined.is_empty() {
            for node in &joined {
                info!("Member joined: {} ({} @ {})", node.id, node.cluster, node.rpc_addr);
            }
            self.emit(MembershipEvent::Join(joined));
        }
        if !updated.is_empty() {
            for node in &updated {
                info!("Member updated: {} ({} @ {})", node.id, node.cluster, node.rpc_addr);
            }
            self.emit(MembershipEvent::Update(updated));
        }
        count
    }

    fn mark_left(&self, node_id: &NodeId, incarnation: u64) {
        let node = {
            let mut members = self.members.write();
            match members.get_mut(node_id) {
                Some(entry)
                    if entry.digest.incarnation <= incarnation
                        && entry.digest.node.state != MemberState::Left =>
                {
                    entry.digest.incarnation = incarnation;
                    entry.digest.node.state = MemberState::Left;
                    entry.state_changed = Instant::now();
                    Some(entry.digest.node.clone())
                }
                _ => None,
            }
        };
        if let Some(node) = node {
            info!("Member left: {} ({})", node.id, node.cluster);
            self.emit(MembershipEvent::Leave(vec![node]));
        }
    }

    /// Mark silent members failed and forget long-gone ones
    fn detect_failures(&self) {
        let now = Instant::now();
        let mut failed = Vec::new();
        {
            let mut members = self.members.write();
            for entry in members.values_mut() {
                if entry.digest.node.is_alive()
                    && now.duration_since(entry.last_seen) > self.config.failure_timeout
                {
                    entry.digest.node.state = MemberState::Failed;
                    entry.state_changed = now;
                    failed.push(entry.digest.node.clone());
                }
            }
            members.retain(|id, entry| {
                let expired = !entry.digest.node.is_alive()
                    && now.duration_since(entry.state_changed) > self.config.reap_timeout;
                if expired {
                    debug!("Reaping member {} ({})", id, entry.digest.node.state);
                }
                !expired
            });
        }
        if !failed.is_empty() {
            for node in &failed {
                warn!("Member failed: {} ({})", node.id, node.cluster);
            }
            self.emit(MembershipEvent::Leave(failed));
        }
    }

    async fn handle_message(&self, message: GossipMessage, from: SocketAddr) {
        match message {
            GossipMessage::Join { member } => {
                debug!("Join request from {} at {}", member.node.id, from);
                self.merge_digests(vec![member.clone()]);
                let ack = GossipMessage::JoinAck {
                    members: self.live_digests(),
                };
                if let Err(e) = self.send(&ack, member.gossip_addr).await {
                    warn!("Failed to acknowledge join of {}: {}", member.node.id, e);
                }
            }
            GossipMessage::JoinAck { members } => {
                self.merge_digests(members);
                if self.member_count() > 0 {
                    self.joined.notify_one();
                }
            }
            GossipMessage::Heartbeat { from: _, members } => {
                self.merge_digests(members);
            }
            GossipMessage::Leave { node, incarnation } => {
                self.mark_left(&node, incarnation);
            }
            GossipMessage::UserEvent(event) => {
                if event.origin == self.config.node.id {
                    return;
                }
                if self.seen_events.lock().insert(&event.origin, event.sequence) {
                    self.emit(MembershipEvent::User(event));
                } else {
                    trace!("Duplicate user event {}#{}", event.origin, event.sequence);
                }
            }
        }
    }

    fn spawn_receiver(self: &Arc<Self>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let membership = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            // ICMP unreachable from a dead peer surfaces here
                            trace!("Gossip recv error: {}", e);
                            continue;
                        }
                    },
                    _ = shutdown.cancelled() => break,
                };
                match GossipMessage::decode(&buf[..len]) {
                    Ok(message) => membership.handle_message(message, from).await,
                    Err(e) => debug!("Dropping malformed gossip from {}: {}", from, e),
                }
            }
        })
    }

    fn spawn_delivery(self: &Arc<Self>) -> JoinHandle<()> {
        let membership = self.clone();
        let shutdown = self.shutdown.clone();
        let receiver = self.events_rx.lock().take();
        tokio::spawn(async move {
            let Some(mut receiver) = receiver else {
                return;
            };
            loop {
                let event = tokio::select! {
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };
                let handlers: Vec<Arc<dyn EventHandler>> = membership.handlers.read().clone();
                for handler in &handlers {
                    match &event {
                        MembershipEvent::Join(nodes) => handler.on_member_join(nodes),
                        MembershipEvent::Leave(nodes) => handler.on_member_leave(nodes),
                        MembershipEvent::Update(nodes) => handler.on_member_update(nodes),
                        MembershipEvent::User(event) => handler.on_user_event(event),
                    }
                }
            }
        })
    }

    fn spawn_gossip(self: &Arc<Self>) -> JoinHandle<()> {
        let membership = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(membership.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => membership.gossip_round().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    async fn gossip_round(&self) {
        if self.left.load(Ordering::SeqCst) {
            return;
        }
        self.heartbeat.fetch_add(1, Ordering::SeqCst);
        self.detect_failures();

        let live = self.live_entries();
        if live.is_empty() {
            // partitioned or alone: keep knocking on the seeds
            if !self.config.seeds.is_empty() {
                let join = GossipMessage::Join {
                    member: self.local_digest(),
                };
                for seed in &self.config.seeds {
                    let _ = self.send(&join, *seed).await;
                }
            }
            return;
        }

        let targets: Vec<SocketAddr> = {
            let mut rng = rand::thread_rng();
            live.choose_multiple(&mut rng, self.config.fanout)
                .map(|e| e.digest.gossip_addr)
                .collect()
        };
        let message = GossipMessage::Heartbeat {
            from: self.config.node.id.clone(),
            members: self.live_digests(),
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Heartbeat not sent: {}", e);
                return;
            }
        };
        let Some(socket) = self.socket.read().clone() else {
            return;
        };
        for addr in targets {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                debug!("Heartbeat to {} failed: {}", addr, e);
            }
        }
    }
}

impl MemberView for Membership {
    fn local_node(&self) -> Node {
        self.config.node.clone()
    }

    fn live_members(&self) -> Vec<Node> {
        self.live_entries().into_iter().map(|e| e.digest.node).collect()
    }

    fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), MembershipError> {
        let socket = self
            .socket
            .read()
            .clone()
            .ok_or(MembershipError::NotStarted)?;
        let sequence = self.event_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = GossipMessage::UserEvent(UserEvent {
            origin: self.config.node.id.clone(),
            sequence,
            name: name.to_string(),
            payload,
        })
        .encode()?;

        for entry in self.live_entries() {
            // best effort: a full socket buffer drops the event for that peer
            if let Err(e) = socket.try_send_to(&bytes, entry.digest.gossip_addr) {
                debug!("User event to {} dropped: {}", entry.digest.node.id, e);
            }
        }
        Ok(())
    }
}
