//! Registry bridge: access to the local cluster's service registry
//!
//! The bridge is the only path through which syncerd reads the local
//! cluster's authoritative records and writes replicas of remote ones.
//! Replicas always carry the owning cluster as provenance, so the bridge
//! refuses any write that would overwrite a locally owned record.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use syncer_core::canonical::normalize_record;
use syncer_core::types::*;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry unreachable: {0}")]
    Unreachable(String),
    #[error("Refusing to overwrite locally owned record {0}")]
    LocalProvenance(ReplicaKey),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Seed file error: {0}")]
    Seed(#[from] serde_json::Error),
}

/// Data-access contract between the synchronizer and the local registry
#[async_trait]
pub trait RegistryBridge: Send + Sync {
    /// Reachability probe used before any sync work starts
    async fn health(&self) -> Result<(), RegistryError>;

    /// The local cluster's own (authoritative) records
    async fn export_records(&self) -> Result<Vec<ServiceRecord>, RegistryError>;

    /// Replicas currently held for a remote owner
    async fn replicas(&self, provenance: &ClusterId) -> Result<Vec<ServiceRecord>, RegistryError>;

    /// Insert or replace a replica
    async fn apply(&self, record: ServiceRecord) -> Result<(), RegistryError>;

    /// Drop a replica
    async fn remove(&self, key: &ReplicaKey) -> Result<(), RegistryError>;
}

/// Service entry in a registry seed file
#[derive(Debug, Deserialize)]
struct SeedService {
    service_id: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    instances: Vec<Instance>,
}

/// In-process registry keyed by (service id, provenance)
pub struct MemoryRegistry {
    local: ClusterId,
    records: RwLock<HashMap<ReplicaKey, ServiceRecord>>,
    /// Replica writes (apply + remove) accepted so far
    writes: AtomicU64,
    reachable: AtomicBool,
}

impl MemoryRegistry {
    pub fn new(local: ClusterId) -> Self {
        Self {
            local,
            records: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// Build a registry pre-populated from a JSON seed file of local services
    pub fn from_seed_file(local: ClusterId, path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        let seeds: Vec<SeedService> = serde_json::from_str(&content)?;

        let registry = Self::new(local.clone());
        for seed in seeds {
            let mut record = ServiceRecord::new(seed.service_id, local.clone());
            record.attributes = seed.attributes;
            record.instances = seed.instances;
            registry.register(record);
        }
        Ok(registry)
    }

    pub fn local_cluster(&self) -> &ClusterId {
        &self.local
    }

    /// Register or update a locally owned service
    pub fn register(&self, mut record: ServiceRecord) {
        record.provenance = self.local.clone();
        record.modified_at = now_millis();
        normalize_record(&mut record);
        self.records.write().insert(record.key(), record);
    }

    /// Deregister a locally owned service
    pub fn deregister(&self, service_id: &ServiceId) -> bool {
        let key = ReplicaKey {
            service_id: service_id.clone(),
            provenance: self.local.clone(),
        };
        self.records.write().remove(&key).is_some()
    }

    /// Look up any record (local or replica)
    pub fn get(&self, key: &ReplicaKey) -> Option<ServiceRecord> {
        self.records.read().get(key).cloned()
    }

    /// Total number of records held (local + replicas)
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of replica writes accepted
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Simulate the registry going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    fn check_reachable(&self) -> Result<(), RegistryError> {
        if self.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(RegistryError::Unreachable(format!(
                "registry for {} is offline",
                self.local
            )))
        }
    }
}

#[async_trait]
impl RegistryBridge for MemoryRegistry {
    async fn health(&self) -> Result<(), RegistryError> {
        self.check_reachable()
    }

    async fn export_records(&self) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.check_reachable()?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.provenance == self.local)
            .cloned()
            .collect())
    }

    async fn replicas(&self, provenance: &ClusterId) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.check_reachable()?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| &r.provenance == provenance)
            .cloned()
            .collect())
    }

    async fn apply(&self, record: ServiceRecord) -> Result<(), RegistryError> {
        self.check_reachable()?;
        if record.provenance == self.local {
            return Err(RegistryError::LocalProvenance(record.key()));
        }
        self.records.write().insert(record.key(), record);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, key: &ReplicaKey) -> Result<(), RegistryError> {
        self.check_reachable()?;
        if key.provenance == self.local {
            return Err(RegistryError::LocalProvenance(key.clone()));
        }
        self.records.write().remove(key);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
