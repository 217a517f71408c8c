//! Persistent storage using sled

use sled::Db;
use std::path::Path;
use syncer_core::types::*;
use thiserror::Error;

/// Metadata key holding the last export version minted by this node
const EXPORT_VERSION_KEY: &str = "export_version";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Corrupted value under {0}")]
    Corrupted(String),
}

/// Local state store for syncerd
pub struct Storage {
    db: Db,
    /// Checkpoint tree: peer cluster id -> Checkpoint
    checkpoints: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let checkpoints = db.open_tree("checkpoints")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            checkpoints,
            metadata,
        })
    }

    /// Get the checkpoint for a peer cluster; a never-merged peer yields version 0
    pub fn get_checkpoint(&self, peer: &ClusterId) -> Result<Checkpoint, StorageError> {
        match self.checkpoints.get(peer.as_str())? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Ok(Checkpoint::empty(peer.clone())),
        }
    }

    /// Store a checkpoint and make it durable
    pub fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(checkpoint)?;
        self.checkpoints.insert(checkpoint.peer.as_str(), value)?;
        self.checkpoints.flush()?;
        Ok(())
    }

    /// All stored checkpoints
    pub fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.checkpoints
            .iter()
            .map(|result| {
                let (_, bytes) = result?;
                Ok(postcard::from_bytes(&bytes)?)
            })
            .collect()
    }

    /// Last export version minted (0 if none)
    pub fn export_version(&self) -> Result<u64, StorageError> {
        match self.metadata.get(EXPORT_VERSION_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted(EXPORT_VERSION_KEY.into()))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Mint the next export version. Persisted before it is returned so a
    /// restart never reissues a version.
    pub fn next_export_version(&self) -> Result<u64, StorageError> {
        let next = self.export_version()? + 1;
        self.metadata
            .insert(EXPORT_VERSION_KEY, &next.to_le_bytes())?;
        self.metadata.flush()?;
        Ok(next)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
