//! Local export: versioned snapshots of the local registry
//!
//! The [`Exporter`] turns the registry bridge's current records into an
//! immutable, checksummed [`Snapshot`]. A new version is only minted when
//! the content changed since the previous export; records keep the version
//! at which they last changed, and removed services leave tombstones so
//! peers can be answered with deltas.
//!
//! The [`ExportCache`] holds the latest export and answers incoming pulls.
//! It exists before the registry bridge is up, answering `Unavailable`
//! until the first export completes.

use crate::registry::{RegistryBridge, RegistryError};
use crate::storage::{Storage, StorageError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use syncer_core::canonical::normalize_record;
use syncer_core::checksum::seal_snapshot;
use syncer_core::types::*;
use syncer_net::messages::{PullRequest, PullResponse};
use syncer_net::transport::SnapshotSource;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] syncer_core::Error),
}

/// Result of one export
#[derive(Debug, Clone)]
pub enum ExportOutcome {
    /// Content changed; a new version was minted
    Minted(Arc<Snapshot>),
    /// Content identical to the previous export
    Unchanged(Arc<Snapshot>),
}

impl ExportOutcome {
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        match self {
            ExportOutcome::Minted(s) | ExportOutcome::Unchanged(s) => s,
        }
    }
}

/// Tombstones kept for delta answers; older removals fall back to full snapshots
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 4096;

#[derive(Debug)]
struct ExportState {
    /// Oldest `since` a delta can be answered from exactly
    base_version: u64,
    /// Full snapshot at the latest version
    current: Arc<Snapshot>,
    /// Services removed since `base_version`, with the version of removal
    tombstones: BTreeMap<ServiceId, u64>,
}

impl ExportState {
    /// Drop the oldest tombstones beyond `limit`, moving `base_version` past them
    fn prune_tombstones(&mut self, limit: usize) {
        if self.tombstones.len() <= limit {
            return;
        }
        let mut by_version: Vec<(u64, ServiceId)> = self
            .tombstones
            .iter()
            .map(|(service_id, version)| (*version, service_id.clone()))
            .collect();
        by_version.sort();
        let excess = by_version.len() - limit;
        for (version, service_id) in by_version.into_iter().take(excess) {
            self.tombstones.remove(&service_id);
            self.base_version = self.base_version.max(version);
        }
        debug!(
            "Pruned {} tombstones; deltas now served since {}",
            excess, self.base_version
        );
    }
}

/// Latest local export, shared with the pull transport
pub struct ExportCache {
    cluster: ClusterId,
    tombstone_limit: usize,
    state: RwLock<Option<ExportState>>,
}

impl ExportCache {
    pub fn new(cluster: ClusterId) -> Self {
        Self::with_tombstone_limit(cluster, DEFAULT_TOMBSTONE_LIMIT)
    }

    pub fn with_tombstone_limit(cluster: ClusterId, tombstone_limit: usize) -> Self {
        Self {
            cluster,
            tombstone_limit,
            state: RwLock::new(None),
        }
    }

    /// Latest full snapshot, if any export has completed
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.state.read().as_ref().map(|s| s.current.clone())
    }

    /// Latest export version (0 before the first export)
    pub fn current_version(&self) -> u64 {
        self.state
            .read()
            .as_ref()
            .map(|s| s.current.version())
            .unwrap_or(0)
    }

    /// Build the response to a pull.
    ///
    /// A delta is served when `since` lies inside the window this process
    /// has tracked tombstones for; anything else gets the full snapshot.
    pub fn respond(&self, since: u64) -> Result<PullResponse, syncer_core::Error> {
        let state = self.state.read();
        let Some(state) = state.as_ref() else {
            return Ok(PullResponse::Unavailable {
                reason: format!("cluster {} has not exported yet", self.cluster),
            });
        };
        let current_version = state.current.version();

        if since == 0 || since < state.base_version || since > current_version {
            if since > current_version {
                warn!(
                    "Peer asked for changes since {} but our latest export is {}; serving full",
                    since, current_version
                );
            }
            return Ok(PullResponse::Snapshot {
                snapshot: (*state.current).clone(),
                current_version,
            });
        }

        let records = state
            .current
            .records()
            .iter()
            .filter(|r| r.version > since)
            .cloned()
            .collect();
        let removed = state
            .tombstones
            .iter()
            .filter(|(_, version)| **version > since)
            .map(|(service_id, version)| Tombstone {
                service_id: service_id.clone(),
                version: *version,
            })
            .collect();

        let snapshot = seal_snapshot(SnapshotBody {
            cluster: self.cluster.clone(),
            version: current_version,
            kind: SnapshotKind::Delta { since },
            records,
            removed,
        })?;

        Ok(PullResponse::Snapshot {
            snapshot,
            current_version,
        })
    }
}

impl SnapshotSource for ExportCache {
    fn answer(&self, request: &PullRequest) -> PullResponse {
        match self.respond(request.since_version) {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to build snapshot for {}: {}", request.requester, e);
                PullResponse::Unavailable {
                    reason: format!("snapshot encoding failed: {}", e),
                }
            }
        }
    }
}

/// Produces versioned exports of the local registry into an [`ExportCache`]
pub struct Exporter {
    cluster: ClusterId,
    registry: Arc<dyn RegistryBridge>,
    storage: Arc<Storage>,
    cache: Arc<ExportCache>,
    /// Serializes exports so two never mint from the same previous state
    export_lock: tokio::sync::Mutex<()>,
}

impl Exporter {
    pub fn new(
        registry: Arc<dyn RegistryBridge>,
        storage: Arc<Storage>,
        cache: Arc<ExportCache>,
    ) -> Self {
        Self {
            cluster: cache.cluster.clone(),
            registry,
            storage,
            cache,
            export_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<ExportCache> {
        &self.cache
    }

    /// Export the local registry, minting a new version only on change
    pub async fn export(&self) -> Result<ExportOutcome, ExportError> {
        let _guard = self.export_lock.lock().await;

        let mut records: Vec<ServiceRecord> = self
            .registry
            .export_records()
            .await?
            .into_iter()
            .filter(|r| r.provenance == self.cluster)
            .collect();
        for record in &mut records {
            normalize_record(record);
        }

        let previous = self.cache.current();
        let previous_records: HashMap<&ServiceId, &ServiceRecord> = previous
            .as_ref()
            .map(|s| s.records().iter().map(|r| (&r.service_id, r)).collect())
            .unwrap_or_default();

        let mut changed = previous.is_none();
        for record in &mut records {
            match previous_records.get(&record.service_id) {
                Some(prev) if prev.same_content(record) => {
                    record.version = prev.version;
                    record.modified_at = prev.modified_at;
                }
                _ => {
                    record.version = 0;
                    changed = true;
                }
            }
        }

        let current_ids: HashSet<&ServiceId> = records.iter().map(|r| &r.service_id).collect();
        let removed: Vec<ServiceId> = previous_records
            .keys()
            .filter(|id| !current_ids.contains(**id))
            .map(|id| (*id).clone())
            .collect();
        if !removed.is_empty() {
            changed = true;
        }

        if !changed {
            if let Some(previous) = previous.clone() {
                debug!("Local export unchanged at version {}", previous.version());
                return Ok(ExportOutcome::Unchanged(previous));
            }
        }
        drop(previous_records);

        let version = self.storage.next_export_version()?;
        let now = now_millis();
        for record in &mut records {
            if record.version == 0 {
                record.version = version;
                if record.modified_at == 0 {
                    record.modified_at = now;
                }
            }
        }

        let snapshot = Arc::new(seal_snapshot(SnapshotBody {
            cluster: self.cluster.clone(),
            version,
            kind: SnapshotKind::Full,
            records,
            removed: Vec::new(),
        })?);

        {
            let mut state = self.cache.state.write();
            match state.as_mut() {
                Some(state) => {
                    for service_id in removed {
                        state.tombstones.insert(service_id, version);
                    }
                    for record in snapshot.records() {
                        state.tombstones.remove(&record.service_id);
                    }
                    state.prune_tombstones(self.cache.tombstone_limit);
                    state.current = snapshot.clone();
                }
                None => {
                    *state = Some(ExportState {
                        base_version: version,
                        current: snapshot.clone(),
                        tombstones: BTreeMap::new(),
                    });
                }
            }
        }

        info!(
            "Exported {} local services at version {}",
            snapshot.records().len(),
            version
        );
        Ok(ExportOutcome::Minted(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use syncer_core::checksum::verify_snapshot;
    use tempfile::tempdir;

    fn setup() -> (Arc<MemoryRegistry>, Exporter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let dc = ClusterId::new("dc1");
        let registry = Arc::new(MemoryRegistry::new(dc.clone()));
        let cache = Arc::new(ExportCache::new(dc));
        let exporter = Exporter::new(registry.clone(), storage, cache);
        (registry, exporter, dir)
    }

    fn local(service: &str) -> ServiceRecord {
        ServiceRecord::new(service, ClusterId::new("dc1"))
    }

    #[tokio::test]
    async fn test_unavailable_before_first_export() {
        let cache = ExportCache::new(ClusterId::new("dc1"));
        let response = cache.answer(&PullRequest::full(ClusterId::new("dc2")));
        assert!(matches!(response, PullResponse::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_version_minted_only_on_change() {
        let (registry, exporter, _dir) = setup();
        registry.register(local("orders"));

        let first = exporter.export().await.unwrap();
        assert!(matches!(first, ExportOutcome::Minted(_)));
        assert_eq!(first.snapshot().version(), 1);

        let second = exporter.export().await.unwrap();
        assert!(matches!(second, ExportOutcome::Unchanged(_)));
        assert_eq!(second.snapshot().version(), 1);

        registry.register(local("payments"));
        let third = exporter.export().await.unwrap();
        assert!(matches!(third, ExportOutcome::Minted(_)));
        assert_eq!(third.snapshot().version(), 2);

        // untouched record keeps the version it last changed at
        let orders = third
            .snapshot()
            .records()
            .iter()
            .find(|r| r.service_id.as_str() == "orders")
            .unwrap();
        assert_eq!(orders.version, 1);
        assert!(verify_snapshot(third.snapshot()).is_ok());
    }

    #[tokio::test]
    async fn test_delta_carries_changes_and_tombstones() {
        let (registry, exporter, _dir) = setup();
        registry.register(local("orders"));
        registry.register(local("payments"));
        exporter.export().await.unwrap(); // v1

        registry.deregister(&ServiceId::new("payments"));
        registry.register(local("shipping"));
        exporter.export().await.unwrap(); // v2

        let response = exporter.cache().respond(1).unwrap();
        let PullResponse::Snapshot { snapshot, current_version } = response else {
            panic!("expected snapshot");
        };
        assert_eq!(current_version, 2);
        assert_eq!(snapshot.kind(), SnapshotKind::Delta { since: 1 });
        assert_eq!(snapshot.records().len(), 1);
        assert_eq!(snapshot.records()[0].service_id.as_str(), "shipping");
        assert_eq!(snapshot.removed().len(), 1);
        assert_eq!(snapshot.removed()[0].service_id.as_str(), "payments");
        assert!(verify_snapshot(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn test_full_served_for_unknown_history() {
        let (registry, exporter, _dir) = setup();
        registry.register(local("orders"));
        exporter.export().await.unwrap();

        for since in [0, 9] {
            let PullResponse::Snapshot { snapshot, .. } = exporter.cache().respond(since).unwrap()
            else {
                panic!("expected snapshot");
            };
            assert!(snapshot.is_full());
        }
    }

    #[tokio::test]
    async fn test_old_tombstones_pruned_and_served_full() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let registry = Arc::new(MemoryRegistry::new(ClusterId::new("dc1")));
        let cache = Arc::new(ExportCache::with_tombstone_limit(ClusterId::new("dc1"), 2));
        let exporter = Exporter::new(registry.clone(), storage, cache);

        for service in ["a", "b", "c", "d"] {
            registry.register(local(service));
        }
        exporter.export().await.unwrap(); // v1
        for service in ["a", "b", "c"] {
            registry.deregister(&ServiceId::new(service));
            exporter.export().await.unwrap(); // v2, v3, v4
        }

        // removal of "a" at v2 fell out of the window
        let PullResponse::Snapshot { snapshot, .. } = exporter.cache().respond(1).unwrap() else {
            panic!("expected snapshot");
        };
        assert!(snapshot.is_full());
        assert_eq!(snapshot.records().len(), 1);

        let PullResponse::Snapshot { snapshot, .. } = exporter.cache().respond(2).unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.kind(), SnapshotKind::Delta { since: 2 });
        let removed: Vec<&str> = snapshot.removed().iter().map(|t| t.service_id.as_str()).collect();
        assert_eq!(removed, vec!["b", "c"]);
        assert!(verify_snapshot(&snapshot).is_ok());
    }

    #[tokio::test]
    async fn test_reappearing_service_clears_tombstone() {
        let (registry, exporter, _dir) = setup();
        registry.register(local("orders"));
        exporter.export().await.unwrap(); // v1
        registry.deregister(&ServiceId::new("orders"));
        exporter.export().await.unwrap(); // v2
        registry.register(local("orders"));
        exporter.export().await.unwrap(); // v3

        let PullResponse::Snapshot { snapshot, .. } = exporter.cache().respond(1).unwrap() else {
            panic!("expected snapshot");
        };
        assert!(snapshot.removed().is_empty());
        assert_eq!(snapshot.records()[0].version, 3);
    }
}
