//! Reconciliation engine
//!
//! Pulls snapshots from one node per eligible peer cluster, validates them
//! and merges their records into the local registry as replicas. Cycles run
//! on a periodic timer and, out of band, when a peer announces a new export
//! version or joins the overlay.
//!
//! Merge rule: a record owned by cluster C at version V replaces the
//! replica held for (service id, C) only if V is strictly greater than the
//! held version. Checkpoints advance only after every registry write of a
//! merge has succeeded, so an interrupted merge is replayed on the next
//! cycle.

use crate::export::{ExportError, ExportOutcome, Exporter};
use crate::membership::{EventHandler, MemberView};
use crate::registry::{RegistryBridge, RegistryError};
use crate::storage::{Storage, StorageError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncer_core::checksum::verify_snapshot;
use syncer_core::types::*;
use syncer_net::gossip::UserEvent;
use syncer_net::messages::{PullRequest, PullResponse};
use syncer_net::transport::{PullClient, TransportError};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors inside one peer's reconciliation. Never fatal to the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Peer unavailable: {0}")]
    Unavailable(String),
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("Malformed snapshot: {0}")]
    Malformed(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Export error: {0}")]
    Export(#[from] ExportError),
}

impl SyncError {
    /// Failures attributable to the peer or the network
    pub fn is_transient_peer(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout(_)
                | SyncError::Cancelled
                | SyncError::Transport(_)
                | SyncError::Unavailable(_)
                | SyncError::ChecksumMismatch(_)
                | SyncError::Malformed(_)
        )
    }

    /// Failures of the local commit path
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            SyncError::Registry(_) | SyncError::Storage(_) | SyncError::Export(_)
        )
    }
}

impl From<syncer_core::Error> for SyncError {
    fn from(e: syncer_core::Error) -> Self {
        match e {
            syncer_core::Error::ChecksumMismatch { .. } => SyncError::ChecksumMismatch(e.to_string()),
            other => SyncError::Malformed(other.to_string()),
        }
    }
}

/// Engine configuration, projected from the daemon config
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_cluster: ClusterId,
    /// Peer tag filter; empty admits every cluster
    pub scope: BTreeSet<String>,
    pub sync_interval: Duration,
    /// Bound on each pull and on each registry call
    pub pull_timeout: Duration,
    /// Maximum peers reconciled concurrently
    pub workers: usize,
}

/// Registry changes needed to merge one snapshot
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub upserts: Vec<ServiceRecord>,
    pub removals: Vec<ReplicaKey>,
    /// Records and tombstones dropped as stale or duplicate
    pub skipped: usize,
}

impl MergePlan {
    /// Compare a verified snapshot against the replicas held for its owner
    pub fn compute(snapshot: &Snapshot, held: Vec<ServiceRecord>) -> Self {
        let owner = snapshot.cluster();
        let held: HashMap<ServiceId, u64> = held
            .into_iter()
            .filter(|r| &r.provenance == owner)
            .map(|r| (r.service_id, r.version))
            .collect();

        let mut plan = MergePlan::default();
        for record in snapshot.records() {
            match held.get(&record.service_id) {
                Some(version) if *version >= record.version => plan.skipped += 1,
                _ => plan.upserts.push(record.clone()),
            }
        }

        match snapshot.kind() {
            SnapshotKind::Full => {
                let listed: HashSet<&ServiceId> =
                    snapshot.records().iter().map(|r| &r.service_id).collect();
                for (service_id, version) in &held {
                    if !listed.contains(service_id) && *version < snapshot.version() {
                        plan.removals.push(ReplicaKey {
                            service_id: service_id.clone(),
                            provenance: owner.clone(),
                        });
                    }
                }
            }
            SnapshotKind::Delta { .. } => {
                for tombstone in snapshot.removed() {
                    match held.get(&tombstone.service_id) {
                        Some(version) if tombstone.version > *version => {
                            plan.removals.push(ReplicaKey {
                                service_id: tombstone.service_id.clone(),
                                provenance: owner.clone(),
                            });
                        }
                        Some(_) => plan.skipped += 1,
                        None => {}
                    }
                }
            }
        }
        plan.removals.sort();
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Result of reconciling with one peer cluster
#[derive(Debug)]
pub enum PeerOutcome {
    Merged {
        version: u64,
        applied: usize,
        removed: usize,
        skipped: usize,
    },
    /// Snapshot not newer than the checkpoint; nothing written
    Stale { version: u64, checkpoint: u64 },
    /// Another cycle for this peer was already running
    InFlight,
    Failed(SyncError),
}

/// Outcomes of one cycle, sorted by peer cluster
#[derive(Debug, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(ClusterId, PeerOutcome)>,
}

impl CycleReport {
    pub fn merged(&self) -> usize {
        self.count(|o| matches!(o, PeerOutcome::Merged { .. }))
    }

    pub fn stale(&self) -> usize {
        self.count(|o| matches!(o, PeerOutcome::Stale { .. }))
    }

    pub fn in_flight(&self) -> usize {
        self.count(|o| matches!(o, PeerOutcome::InFlight))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PeerOutcome::Failed(_)))
    }

    pub fn outcome(&self, cluster: &ClusterId) -> Option<&PeerOutcome> {
        self.outcomes
            .iter()
            .find(|(c, _)| c == cluster)
            .map(|(_, o)| o)
    }

    fn count(&self, predicate: impl Fn(&PeerOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

/// Engine counters since startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub cycles: u64,
    pub merged: u64,
    pub stale: u64,
    pub failed: u64,
    pub in_flight_skips: u64,
    pub eager_scheduled: u64,
    pub eager_coalesced: u64,
    /// Unix millis at the end of the last cycle (0 = none yet)
    pub last_cycle_at: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    merged: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    in_flight_skips: AtomicU64,
    eager_scheduled: AtomicU64,
    eager_coalesced: AtomicU64,
    last_cycle_at: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &PeerOutcome) {
        let counter = match outcome {
            PeerOutcome::Merged { .. } => &self.merged,
            PeerOutcome::Stale { .. } => &self.stale,
            PeerOutcome::InFlight => &self.in_flight_skips,
            PeerOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks a peer cluster as being reconciled until dropped
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<ClusterId>>,
    cluster: ClusterId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.cluster);
    }
}

/// Reconciliation engine
pub struct Engine {
    config: EngineConfig,
    members: Arc<dyn MemberView>,
    client: Arc<dyn PullClient>,
    registry: Arc<dyn RegistryBridge>,
    storage: Arc<Storage>,
    exporter: Arc<Exporter>,
    /// Peer clusters with a reconciliation running
    in_flight: Mutex<HashSet<ClusterId>>,
    /// Peer clusters with an eager cycle queued but not yet started
    pending: Mutex<HashSet<ClusterId>>,
    eager_tx: mpsc::UnboundedSender<ClusterId>,
    eager_rx: Mutex<Option<mpsc::UnboundedReceiver<ClusterId>>>,
    limiter: Arc<Semaphore>,
    counters: Counters,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        members: Arc<dyn MemberView>,
        client: Arc<dyn PullClient>,
        registry: Arc<dyn RegistryBridge>,
        storage: Arc<Storage>,
        exporter: Arc<Exporter>,
    ) -> Self {
        let (eager_tx, eager_rx) = mpsc::unbounded_channel();
        let limiter = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            members,
            client,
            registry,
            storage,
            exporter,
            in_flight: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
            eager_tx,
            eager_rx: Mutex::new(Some(eager_rx)),
            limiter,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Membership event adapter feeding this engine
    pub fn event_handler(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        Arc::new(EngineEventHandler {
            engine: self.clone(),
        })
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            cycles: c.cycles.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight_skips: c.in_flight_skips.load(Ordering::Relaxed),
            eager_scheduled: c.eager_scheduled.load(Ordering::Relaxed),
            eager_coalesced: c.eager_coalesced.load(Ordering::Relaxed),
            last_cycle_at: c.last_cycle_at.load(Ordering::Relaxed),
        }
    }

    /// Export the local registry; a newly minted version is announced to peers
    pub async fn export_local(&self, cancel: &CancellationToken) -> Result<ExportOutcome, SyncError> {
        let outcome = self.bounded(cancel, self.exporter.export()).await??;
        if let ExportOutcome::Minted(snapshot) = &outcome {
            let event = SyncEvent {
                cluster: self.config.local_cluster.clone(),
                version: snapshot.version(),
            };
            match postcard::to_allocvec(&event) {
                Ok(payload) => {
                    if let Err(e) = self.members.broadcast(SYNC_EVENT_NAME, payload) {
                        warn!("Failed to announce export version {}: {}", event.version, e);
                    }
                }
                Err(e) => warn!("Failed to encode sync event: {}", e),
            }
        }
        Ok(outcome)
    }

    /// Live sync partners: one node per eligible remote cluster (lowest node id)
    pub fn select_peers(&self, only: Option<&ClusterId>) -> Vec<Node> {
        let local = self.members.local_node();
        let mut chosen: BTreeMap<ClusterId, Node> = BTreeMap::new();
        for node in self.members.live_members() {
            if node.id == local.id
                || node.cluster == self.config.local_cluster
                || !node.is_alive()
                || !node.in_scope(&self.config.scope)
            {
                continue;
            }
            if only.map_or(false, |cluster| &node.cluster != cluster) {
                continue;
            }
            match chosen.get(&node.cluster) {
                Some(existing) if existing.id <= node.id => {}
                _ => {
                    chosen.insert(node.cluster.clone(), node);
                }
            }
        }
        chosen.into_values().collect()
    }

    /// One full cycle: refresh the local export, then reconcile every peer
    pub async fn run_cycle(self: &Arc<Self>, cancel: &CancellationToken) -> CycleReport {
        match self.export_local(cancel).await {
            Ok(_) => {}
            Err(e @ (SyncError::Timeout(_) | SyncError::Cancelled)) => {
                warn!("Local export skipped: {}", e)
            }
            Err(e) => warn!("Local export failed: {}", e),
        }
        let peers = self.select_peers(None);
        let report = self.sync_peers(peers, cancel).await;
        info!(
            "Sync cycle done: {} merged, {} stale, {} failed, {} in flight",
            report.merged(),
            report.stale(),
            report.failed(),
            report.in_flight()
        );
        report
    }

    /// Out-of-band cycle restricted to one peer cluster
    pub async fn run_eager(self: &Arc<Self>, cluster: &ClusterId, cancel: &CancellationToken) -> CycleReport {
        self.pending.lock().remove(cluster);
        let peers = self.select_peers(Some(cluster));
        if peers.is_empty() {
            debug!("Eager sync for {} skipped: no live peer", cluster);
        }
        self.sync_peers(peers, cancel).await
    }

    async fn sync_peers(self: &Arc<Self>, peers: Vec<Node>, cancel: &CancellationToken) -> CycleReport {
        let mut tasks = JoinSet::new();
        for node in peers {
            let engine = self.clone();
            let cancel = cancel.clone();
            let limiter = self.limiter.clone();
            tasks.spawn(async move {
                let outcome = match limiter.acquire_owned().await {
                    Ok(_permit) => engine.sync_peer(&node, &cancel).await,
                    Err(_) => PeerOutcome::Failed(SyncError::Cancelled),
                };
                (node.cluster, outcome)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.outcomes.push(result),
                Err(e) => warn!("Peer sync task aborted: {}", e),
            }
        }
        report.outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_cycle_at
            .store(now_millis(), Ordering::Relaxed);
        report
    }

    /// Reconcile with one peer node unless its cluster is already in flight
    pub async fn sync_peer(&self, node: &Node, cancel: &CancellationToken) -> PeerOutcome {
        let outcome = match self.try_begin(&node.cluster) {
            None => {
                debug!("Sync with {} already in flight", node.cluster);
                PeerOutcome::InFlight
            }
            Some(_guard) => match self.reconcile(node, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Sync with {} ({}) failed: {}", node.cluster, node.rpc_addr, e);
                    PeerOutcome::Failed(e)
                }
            },
        };
        self.counters.record(&outcome);
        outcome
    }

    fn try_begin(&self, cluster: &ClusterId) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(cluster.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            cluster: cluster.clone(),
        })
    }

    async fn reconcile(&self, node: &Node, cancel: &CancellationToken) -> Result<PeerOutcome, SyncError> {
        let cluster = &node.cluster;
        let checkpoint = self.storage.get_checkpoint(cluster)?;
        let request = PullRequest {
            requester: self.config.local_cluster.clone(),
            since_version: checkpoint.last_merged_version,
        };

        let response = self
            .bounded(cancel, self.client.pull(node.rpc_addr, request))
            .await??;
        let (snapshot, current_version) = match response {
            PullResponse::Snapshot {
                snapshot,
                current_version,
            } => (snapshot, current_version),
            PullResponse::Unavailable { reason } => return Err(SyncError::Unavailable(reason)),
        };

        verify_snapshot(&snapshot)?;
        if snapshot.cluster() != cluster {
            return Err(SyncError::Malformed(format!(
                "node {} of cluster {} served a snapshot of {}",
                node.id,
                cluster,
                snapshot.cluster()
            )));
        }
        if current_version > snapshot.version() {
            debug!(
                "{} is already at version {}, merging {}",
                cluster,
                current_version,
                snapshot.version()
            );
        }

        if snapshot.version() <= checkpoint.last_merged_version {
            debug!(
                "Stale snapshot from {}: version {} <= checkpoint {}",
                cluster,
                snapshot.version(),
                checkpoint.last_merged_version
            );
            return Ok(PeerOutcome::Stale {
                version: snapshot.version(),
                checkpoint: checkpoint.last_merged_version,
            });
        }
        if let SnapshotKind::Delta { since } = snapshot.kind() {
            if since > checkpoint.last_merged_version {
                return Err(SyncError::Malformed(format!(
                    "delta since {} does not cover checkpoint {}",
                    since, checkpoint.last_merged_version
                )));
            }
        }

        let held = self.bounded(cancel, self.registry.replicas(cluster)).await??;
        let plan = MergePlan::compute(&snapshot, held);
        let applied = plan.upserts.len();
        let removed = plan.removals.len();

        for record in plan.upserts {
            self.bounded(cancel, self.registry.apply(record)).await??;
        }
        for key in &plan.removals {
            self.bounded(cancel, self.registry.remove(key)).await??;
        }

        self.storage.put_checkpoint(&Checkpoint {
            peer: cluster.clone(),
            last_merged_version: snapshot.version(),
            last_merge_timestamp: now_millis(),
        })?;

        info!(
            "Merged {} version {} ({} applied, {} removed, {} skipped)",
            cluster,
            snapshot.version(),
            applied,
            removed,
            plan.skipped
        );
        Ok(PeerOutcome::Merged {
            version: snapshot.version(),
            applied,
            removed,
            skipped: plan.skipped,
        })
    }

    /// Run a suspension point under the pull timeout and the cancellation token
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = T>,
    ) -> Result<T, SyncError> {
        let limit = self.config.pull_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(limit, fut) => result.map_err(|_| SyncError::Timeout(limit)),
        }
    }

    /// Queue an eager cycle for a peer cluster; false if one is already pending
    pub fn schedule_eager(&self, cluster: ClusterId) -> bool {
        if !self.pending.lock().insert(cluster.clone()) {
            self.counters.eager_coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("Eager sync for {} already pending", cluster);
            return false;
        }
        if self.eager_tx.send(cluster.clone()).is_err() {
            self.pending.lock().remove(&cluster);
            return false;
        }
        self.counters.eager_scheduled.fetch_add(1, Ordering::Relaxed);
        debug!("Eager sync scheduled for {}", cluster);
        true
    }

    /// React to a peer's export announcement
    pub fn handle_sync_event(&self, event: &SyncEvent) -> bool {
        if event.cluster == self.config.local_cluster {
            return false;
        }
        let merged = match self.storage.get_checkpoint(&event.cluster) {
            Ok(checkpoint) => checkpoint.last_merged_version,
            Err(e) => {
                warn!("Failed to read checkpoint for {}: {}", event.cluster, e);
                0
            }
        };
        if event.version <= merged {
            debug!(
                "Ignoring sync event {}@{}: already merged {}",
                event.cluster, event.version, merged
            );
            return false;
        }
        if self.select_peers(Some(&event.cluster)).is_empty() {
            debug!("Ignoring sync event from ineligible cluster {}", event.cluster);
            return false;
        }
        self.schedule_eager(event.cluster.clone())
    }

    /// Drain eager triggers until cancelled; cycles for distinct peers overlap
    pub fn spawn_eager_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let receiver = self.eager_rx.lock().take();
        tokio::spawn(async move {
            let Some(mut receiver) = receiver else {
                warn!("Eager worker already started");
                return;
            };
            let mut cycles = JoinSet::new();
            loop {
                tokio::select! {
                    next = receiver.recv() => match next {
                        Some(cluster) => {
                            let engine = engine.clone();
                            let cancel = cancel.clone();
                            cycles.spawn(async move {
                                engine.run_eager(&cluster, &cancel).await;
                            });
                        }
                        None => break,
                    },
                    Some(_) = cycles.join_next(), if !cycles.is_empty() => {}
                    _ = cancel.cancelled() => break,
                }
            }
            while cycles.join_next().await.is_some() {}
        })
    }

    /// Periodic cycles until cancelled; the first runs immediately
    pub fn spawn_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.run_cycle(&cancel).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Sync timer stopped");
        })
    }
}

/// Routes membership and user events into engine triggers
struct EngineEventHandler {
    engine: Arc<Engine>,
}

impl EngineEventHandler {
    fn trigger_for(&self, members: &[Node]) {
        let config = &self.engine.config;
        let clusters: BTreeSet<ClusterId> = members
            .iter()
            .filter(|n| n.cluster != config.local_cluster && n.in_scope(&config.scope))
            .map(|n| n.cluster.clone())
            .collect();
        for cluster in clusters {
            self.engine.schedule_eager(cluster);
        }
    }
}

impl EventHandler for EngineEventHandler {
    fn on_member_join(&self, members: &[Node]) {
        self.trigger_for(members);
    }

    fn on_member_leave(&self, members: &[Node]) {
        for node in members {
            debug!("Peer {} of {} left the overlay", node.id, node.cluster);
        }
    }

    fn on_member_update(&self, members: &[Node]) {
        self.trigger_for(members);
    }

    fn on_user_event(&self, event: &UserEvent) {
        if event.name != SYNC_EVENT_NAME {
            return;
        }
        match postcard::from_bytes::<SyncEvent>(&event.payload) {
            Ok(sync) => {
                self.engine.handle_sync_event(&sync);
            }
            Err(e) => debug!("Malformed sync event from {}: {}", event.origin, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ExportCache;
    use crate::membership::MembershipError;
    use crate::registry::MemoryRegistry;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use syncer_core::checksum::seal_snapshot;
    use tempfile::TempDir;

    struct FakeMembers {
        local: Node,
        live: Mutex<Vec<Node>>,
        broadcasts: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MemberView for FakeMembers {
        fn local_node(&self) -> Node {
            self.local.clone()
        }
        fn live_members(&self) -> Vec<Node> {
            self.live.lock().clone()
        }
        fn broadcast(&self, name: &str, payload: Vec<u8>) -> Result<(), MembershipError> {
            self.broadcasts.lock().push((name.to_string(), payload));
            Ok(())
        }
    }

    #[derive(Clone)]
    enum Script {
        Respond(PullResponse),
        /// Respond after a short delay
        Slow(PullResponse),
        Refuse,
        Hang,
    }

    #[derive(Default)]
    struct FakeClient {
        scripts: Mutex<HashMap<SocketAddr, Script>>,
        pulls: Mutex<Vec<(SocketAddr, PullRequest)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeClient {
        fn script(&self, addr: SocketAddr, script: Script) {
            self.scripts.lock().insert(addr, script);
        }

        fn respond(&self, node: &Node, snapshot: Snapshot) {
            let current_version = snapshot.version();
            self.script(
                node.rpc_addr,
                Script::Respond(PullResponse::Snapshot {
                    snapshot,
                    current_version,
                }),
            );
        }

        fn pulls_to(&self, node: &Node) -> Vec<PullRequest> {
            self.pulls
                .lock()
                .iter()
                .filter(|(addr, _)| *addr == node.rpc_addr)
                .map(|(_, r)| r.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PullClient for FakeClient {
        async fn pull(&self, addr: SocketAddr, request: PullRequest) -> Result<PullResponse, TransportError> {
            self.pulls.lock().push((addr, request));
            let script = self.scripts.lock().get(&addr).cloned();
            match script {
                Some(Script::Respond(response)) => Ok(response),
                Some(Script::Slow(response)) => {
                    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    Ok(response)
                }
                Some(Script::Hang) => std::future::pending().await,
                Some(Script::Refuse) | None => Err(TransportError::ConnectionClosed),
            }
        }
    }

    /// Registry whose export never answers
    struct StalledRegistry;

    #[async_trait]
    impl RegistryBridge for StalledRegistry {
        async fn health(&self) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn export_records(&self) -> Result<Vec<ServiceRecord>, RegistryError> {
            std::future::pending().await
        }
        async fn replicas(&self, _provenance: &ClusterId) -> Result<Vec<ServiceRecord>, RegistryError> {
            Ok(Vec::new())
        }
        async fn apply(&self, _record: ServiceRecord) -> Result<(), RegistryError> {
            Ok(())
        }
        async fn remove(&self, _key: &ReplicaKey) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        members: Arc<FakeMembers>,
        client: Arc<FakeClient>,
        registry: Arc<MemoryRegistry>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    fn node(name: &str, cluster: &str, port: u16) -> Node {
        Node {
            id: NodeId::new(name),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            cluster: ClusterId::new(cluster),
            tags: ["prod".to_string()].into_iter().collect(),
            state: MemberState::Alive,
        }
    }

    fn harness(peers: Vec<Node>, scope: &[&str]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let local = ClusterId::new("dc1");
        let registry = Arc::new(MemoryRegistry::new(local.clone()));
        let cache = Arc::new(ExportCache::new(local.clone()));
        let exporter = Arc::new(Exporter::new(registry.clone(), storage.clone(), cache));
        let members = Arc::new(FakeMembers {
            local: node("self", "dc1", 1),
            live: Mutex::new(peers),
            broadcasts: Mutex::new(Vec::new()),
        });
        let client = Arc::new(FakeClient::default());
        let config = EngineConfig {
            local_cluster: local,
            scope: scope.iter().map(|s| s.to_string()).collect(),
            sync_interval: Duration::from_secs(30),
            pull_timeout: Duration::from_millis(200),
            workers: 4,
        };
        let engine = Arc::new(Engine::new(
            config,
            members.clone(),
            client.clone(),
            registry.clone(),
            storage.clone(),
            exporter,
        ));
        Harness {
            engine,
            members,
            client,
            registry,
            storage,
            _dir: dir,
        }
    }

    /// Engine sharing the harness' members and storage, exporting from a stalled registry
    fn stalled_engine(h: &Harness, pull_timeout: Duration) -> Arc<Engine> {
        let registry: Arc<dyn RegistryBridge> = Arc::new(StalledRegistry);
        let cache = Arc::new(ExportCache::new(ClusterId::new("dc1")));
        let exporter = Arc::new(Exporter::new(registry.clone(), h.storage.clone(), cache));
        let mut config = h.engine.config().clone();
        config.pull_timeout = pull_timeout;
        Arc::new(Engine::new(
            config,
            h.members.clone(),
            h.client.clone(),
            registry,
            h.storage.clone(),
            exporter,
        ))
    }

    fn snapshot(cluster: &str, version: u64, records: &[(&str, u64)]) -> Snapshot {
        seal_snapshot(SnapshotBody {
            cluster: ClusterId::new(cluster),
            version,
            kind: SnapshotKind::Full,
            records: records.iter().map(|(s, v)| replica(s, cluster, *v)).collect(),
            removed: Vec::new(),
        })
        .unwrap()
    }

    fn replica(service: &str, cluster: &str, version: u64) -> ServiceRecord {
        let mut record = ServiceRecord::new(service, ClusterId::new(cluster))
            .with_instance(format!("{}-0", service), vec![format!("rest://{}:8080", cluster)]);
        record.version = version;
        record
    }

    fn key(service: &str, cluster: &str) -> ReplicaKey {
        ReplicaKey {
            service_id: ServiceId::new(service),
            provenance: ClusterId::new(cluster),
        }
    }

    fn set_checkpoint(storage: &Storage, cluster: &str, version: u64) {
        storage
            .put_checkpoint(&Checkpoint {
                peer: ClusterId::new(cluster),
                last_merged_version: version,
                last_merge_timestamp: 1,
            })
            .unwrap();
    }

    fn checkpoint(storage: &Storage, cluster: &str) -> u64 {
        storage
            .get_checkpoint(&ClusterId::new(cluster))
            .unwrap()
            .last_merged_version
    }

    async fn cycle(h: &Harness) -> CycleReport {
        let peers = h.engine.select_peers(None);
        h.engine.sync_peers(peers, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_newer_snapshot_advances_checkpoint() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 3);
        h.client.respond(&dc2, snapshot("dc2", 5, &[("svc1", 5)]));

        let report = cycle(&h).await;
        assert_eq!(report.merged(), 1);
        assert_eq!(h.client.pulls_to(&dc2)[0].since_version, 3);
        assert_eq!(checkpoint(&h.storage, "dc2"), 5);
        let held = h.registry.get(&key("svc1", "dc2")).unwrap();
        assert_eq!(held.version, 5);
        assert_eq!(held.provenance, ClusterId::new("dc2"));
    }

    #[tokio::test]
    async fn test_stale_snapshot_writes_nothing() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 3);
        h.client.respond(&dc2, snapshot("dc2", 2, &[("svc1", 2)]));

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Stale { version: 2, checkpoint: 3 })
        ));
        assert_eq!(checkpoint(&h.storage, "dc2"), 3);
        assert_eq!(h.registry.write_count(), 0);
    }

    #[tokio::test]
    async fn test_remerge_after_lost_checkpoint_is_harmless() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client
            .respond(&dc2, snapshot("dc2", 5, &[("svc1", 5), ("svc2", 4)]));

        cycle(&h).await;
        let first: Vec<_> = [key("svc1", "dc2"), key("svc2", "dc2")]
            .iter()
            .map(|k| h.registry.get(k))
            .collect();
        let writes = h.registry.write_count();

        // registry commit survived but the checkpoint write did not
        set_checkpoint(&h.storage, "dc2", 0);
        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Merged { applied: 0, skipped: 2, .. })
        ));
        let second: Vec<_> = [key("svc1", "dc2"), key("svc2", "dc2")]
            .iter()
            .map(|k| h.registry.get(k))
            .collect();
        assert_eq!(first, second);
        assert_eq!(h.registry.write_count(), writes);
        assert_eq!(checkpoint(&h.storage, "dc2"), 5);
    }

    #[tokio::test]
    async fn test_merge_keeps_maximum_version_in_any_order() {
        let orders: [[u64; 3]; 6] = [
            [3, 5, 7],
            [3, 7, 5],
            [5, 3, 7],
            [5, 7, 3],
            [7, 3, 5],
            [7, 5, 3],
        ];
        for order in orders {
            let registry = MemoryRegistry::new(ClusterId::new("dc1"));
            for version in order {
                let snap = snapshot("dc2", version, &[("svc1", version)]);
                let held = registry.replicas(&ClusterId::new("dc2")).await.unwrap();
                let plan = MergePlan::compute(&snap, held);
                for record in plan.upserts {
                    registry.apply(record).await.unwrap();
                }
                for key in &plan.removals {
                    registry.remove(key).await.unwrap();
                }
            }
            assert_eq!(registry.get(&key("svc1", "dc2")).unwrap().version, 7, "{:?}", order);
        }
    }

    #[tokio::test]
    async fn test_same_service_from_two_owners_coexists() {
        let dc2 = node("b1", "dc2", 2001);
        let dc3 = node("c1", "dc3", 3001);
        let h = harness(vec![dc2.clone(), dc3.clone()], &[]);
        h.client.respond(&dc2, snapshot("dc2", 5, &[("svc1", 5)]));
        h.client.respond(&dc3, snapshot("dc3", 3, &[("svc1", 3)]));

        let report = cycle(&h).await;
        assert_eq!(report.merged(), 2);
        assert_eq!(h.registry.get(&key("svc1", "dc2")).unwrap().version, 5);
        assert_eq!(h.registry.get(&key("svc1", "dc3")).unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_block_others() {
        let dc2 = node("b1", "dc2", 2001);
        let dc3 = node("c1", "dc3", 3001);
        let h = harness(vec![dc2.clone(), dc3.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 1);
        h.client.script(dc2.rpc_addr, Script::Refuse);
        h.client.respond(&dc3, snapshot("dc3", 2, &[("svc9", 2)]));

        let report = cycle(&h).await;
        match report.outcome(&ClusterId::new("dc2")) {
            Some(PeerOutcome::Failed(e)) => assert!(e.is_transient_peer()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.merged(), 1);
        assert_eq!(checkpoint(&h.storage, "dc2"), 1);
        assert_eq!(checkpoint(&h.storage, "dc3"), 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        let mut tampered = snapshot("dc2", 5, &[("svc1", 5)]);
        tampered.body.records[0].attributes.insert("env".into(), "evil".into());
        h.client.respond(&dc2, tampered);

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Failed(SyncError::ChecksumMismatch(_)))
        ));
        assert_eq!(checkpoint(&h.storage, "dc2"), 0);
        assert_eq!(h.registry.write_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_provenance_rejected() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        let forged = seal_snapshot(SnapshotBody {
            cluster: ClusterId::new("dc2"),
            version: 5,
            kind: SnapshotKind::Full,
            records: vec![replica("svc1", "dc3", 5)],
            removed: Vec::new(),
        })
        .unwrap();
        h.client.respond(&dc2, forged);

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Failed(SyncError::Malformed(_)))
        ));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_of_wrong_cluster_rejected() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client.respond(&dc2, snapshot("dc3", 5, &[("svc1", 5)]));

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Failed(SyncError::Malformed(_)))
        ));
        assert_eq!(checkpoint(&h.storage, "dc3"), 0);
    }

    #[tokio::test]
    async fn test_registry_failure_keeps_checkpoint() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 3);
        h.client.respond(&dc2, snapshot("dc2", 5, &[("svc1", 5)]));
        h.registry.set_reachable(false);

        let report = cycle(&h).await;
        match report.outcome(&ClusterId::new("dc2")) {
            Some(PeerOutcome::Failed(e)) => assert!(e.is_store()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(checkpoint(&h.storage, "dc2"), 3);

        h.registry.set_reachable(true);
        assert_eq!(cycle(&h).await.merged(), 1);
        assert_eq!(checkpoint(&h.storage, "dc2"), 5);
    }

    #[tokio::test]
    async fn test_hung_pull_times_out() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client.script(dc2.rpc_addr, Script::Hang);

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Failed(SyncError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_pull_is_skipped() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client.script(dc2.rpc_addr, Script::Hang);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.engine.sync_peer(&dc2, &cancel).await;
        assert!(matches!(outcome, PeerOutcome::Failed(SyncError::Cancelled)));
        assert_eq!(h.engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_stalled_export_times_out() {
        let h = harness(vec![], &[]);
        let engine = stalled_engine(&h, Duration::from_millis(200));

        let result = engine.export_local(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SyncError::Timeout(_))));
        assert!(h.members.broadcasts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_export_does_not_block_timer_shutdown() {
        let h = harness(vec![], &[]);
        let engine = stalled_engine(&h, Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let timer = engine.spawn_timer(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let stopped = tokio::time::timeout(Duration::from_secs(3), timer).await;
        assert!(stopped.is_ok(), "timer still running after cancel");
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrent_pulls() {
        let peers: Vec<Node> = (0..10u16)
            .map(|i| node(&format!("p{}", i), &format!("dc{}", i + 2), 2000 + i))
            .collect();
        let h = harness(peers.clone(), &[]);
        for peer in &peers {
            let snap = snapshot(peer.cluster.as_str(), 1, &[("svc1", 1)]);
            h.client.script(
                peer.rpc_addr,
                Script::Slow(PullResponse::Snapshot {
                    snapshot: snap,
                    current_version: 1,
                }),
            );
        }

        let report = cycle(&h).await;
        assert_eq!(report.merged(), 10);
        let peak = h.client.peak.load(Ordering::SeqCst);
        assert!(peak <= h.engine.config().workers, "peak {}", peak);
        assert!(peak > 1, "pulls never overlapped");
    }

    #[tokio::test]
    async fn test_peer_in_flight_is_skipped() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client.respond(&dc2, snapshot("dc2", 5, &[("svc1", 5)]));

        let guard = h.engine.try_begin(&dc2.cluster).unwrap();
        let outcome = h.engine.sync_peer(&dc2, &CancellationToken::new()).await;
        assert!(matches!(outcome, PeerOutcome::InFlight));
        assert!(h.client.pulls_to(&dc2).is_empty());

        drop(guard);
        let outcome = h.engine.sync_peer(&dc2, &CancellationToken::new()).await;
        assert!(matches!(outcome, PeerOutcome::Merged { .. }));
    }

    #[tokio::test]
    async fn test_full_snapshot_drops_unlisted_replicas() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client
            .respond(&dc2, snapshot("dc2", 1, &[("svc1", 1), ("svc2", 1)]));
        cycle(&h).await;

        h.client.respond(&dc2, snapshot("dc2", 2, &[("svc1", 1)]));
        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Merged { removed: 1, .. })
        ));
        assert!(h.registry.get(&key("svc1", "dc2")).is_some());
        assert!(h.registry.get(&key("svc2", "dc2")).is_none());
    }

    #[tokio::test]
    async fn test_delta_tombstone_removes_replica() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        h.client
            .respond(&dc2, snapshot("dc2", 2, &[("svc1", 1), ("svc2", 2)]));
        cycle(&h).await;

        let delta = seal_snapshot(SnapshotBody {
            cluster: ClusterId::new("dc2"),
            version: 3,
            kind: SnapshotKind::Delta { since: 2 },
            records: vec![replica("svc3", "dc2", 3)],
            removed: vec![Tombstone {
                service_id: ServiceId::new("svc1"),
                version: 3,
            }],
        })
        .unwrap();
        h.client.respond(&dc2, delta);

        cycle(&h).await;
        assert!(h.registry.get(&key("svc1", "dc2")).is_none());
        assert!(h.registry.get(&key("svc2", "dc2")).is_some());
        assert!(h.registry.get(&key("svc3", "dc2")).is_some());
        assert_eq!(checkpoint(&h.storage, "dc2"), 3);
    }

    #[tokio::test]
    async fn test_delta_with_gap_rejected() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 1);
        let delta = seal_snapshot(SnapshotBody {
            cluster: ClusterId::new("dc2"),
            version: 4,
            kind: SnapshotKind::Delta { since: 2 },
            records: vec![replica("svc1", "dc2", 4)],
            removed: Vec::new(),
        })
        .unwrap();
        h.client.respond(&dc2, delta);

        let report = cycle(&h).await;
        assert!(matches!(
            report.outcome(&ClusterId::new("dc2")),
            Some(PeerOutcome::Failed(SyncError::Malformed(_)))
        ));
        assert_eq!(checkpoint(&h.storage, "dc2"), 1);
    }

    #[test]
    fn test_peer_selection() {
        let mut failed = node("d1", "dc4", 4001);
        failed.state = MemberState::Failed;
        let mut staging = node("e1", "dc5", 5001);
        staging.tags = ["staging".to_string()].into_iter().collect();
        let h = harness(
            vec![
                node("self", "dc1", 1),
                node("a2", "dc1", 1002),
                node("b2", "dc2", 2002),
                node("b1", "dc2", 2001),
                node("c1", "dc3", 3001),
                failed,
                staging,
            ],
            &["prod"],
        );

        let peers = h.engine.select_peers(None);
        let ids: Vec<&str> = peers.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "c1"]);

        let only = h.engine.select_peers(Some(&ClusterId::new("dc3")));
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].id, NodeId::new("c1"));
    }

    #[tokio::test]
    async fn test_sync_event_schedules_one_eager_cycle() {
        let dc2 = node("b1", "dc2", 2001);
        let dc3 = node("c1", "dc3", 3001);
        let h = harness(vec![dc2.clone(), dc3.clone()], &[]);
        set_checkpoint(&h.storage, "dc2", 5);
        h.client.respond(&dc2, snapshot("dc2", 6, &[("svc1", 6)]));
        h.client.respond(&dc3, snapshot("dc3", 1, &[("svc7", 1)]));

        let event = SyncEvent {
            cluster: ClusterId::new("dc2"),
            version: 6,
        };
        assert!(h.engine.handle_sync_event(&event));
        assert!(!h.engine.handle_sync_event(&event));
        assert!(!h.engine.handle_sync_event(&SyncEvent {
            cluster: ClusterId::new("dc2"),
            version: 5,
        }));
        let stats = h.engine.stats();
        assert_eq!(stats.eager_scheduled, 1);
        assert_eq!(stats.eager_coalesced, 1);

        let cancel = CancellationToken::new();
        let worker = h.engine.spawn_eager_worker(cancel.clone());
        for _ in 0..100 {
            if checkpoint(&h.storage, "dc2") == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(checkpoint(&h.storage, "dc2"), 6);
        assert_eq!(h.client.pulls_to(&dc2).len(), 1);
        assert!(h.client.pulls_to(&dc3).is_empty());

        // the cycle started, so a newer announcement queues again
        assert!(h.engine.handle_sync_event(&SyncEvent {
            cluster: ClusterId::new("dc2"),
            version: 7,
        }));

        cancel.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_user_event_routed_to_engine() {
        let dc2 = node("b1", "dc2", 2001);
        let h = harness(vec![dc2], &[]);
        let handler = h.engine.event_handler();

        let payload = postcard::to_allocvec(&SyncEvent {
            cluster: ClusterId::new("dc2"),
            version: 9,
        })
        .unwrap();
        handler.on_user_event(&UserEvent {
            origin: NodeId::new("b1"),
            sequence: 1,
            name: "unrelated".into(),
            payload: payload.clone(),
        });
        assert_eq!(h.engine.stats().eager_scheduled, 0);

        handler.on_user_event(&UserEvent {
            origin: NodeId::new("b1"),
            sequence: 2,
            name: SYNC_EVENT_NAME.into(),
            payload,
        });
        assert_eq!(h.engine.stats().eager_scheduled, 1);

        // joining node of an already pending cluster coalesces
        handler.on_member_join(&[node("b3", "dc2", 2003), node("a9", "dc1", 1009)]);
        assert_eq!(h.engine.stats().eager_scheduled, 1);
        assert_eq!(h.engine.stats().eager_coalesced, 1);
    }

    #[tokio::test]
    async fn test_new_export_announced_once() {
        let h = harness(vec![], &[]);
        h.registry
            .register(ServiceRecord::new("orders", ClusterId::new("dc1")));

        let cancel = CancellationToken::new();
        h.engine.export_local(&cancel).await.unwrap();
        h.engine.export_local(&cancel).await.unwrap();

        let broadcasts = h.members.broadcasts.lock().clone();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, SYNC_EVENT_NAME);
        let event: SyncEvent = postcard::from_bytes(&broadcasts[0].1).unwrap();
        assert_eq!(event.cluster, ClusterId::new("dc1"));
        assert_eq!(event.version, 1);
    }
}
