//! Error types for the synchronizer core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Checksum mismatch (computed != transmitted)
    #[error("checksum mismatch: computed {computed} != transmitted {transmitted}")]
    ChecksumMismatch { computed: String, transmitted: String },

    /// Repeated field ordering violation
    #[error("repeated field not sorted/deduped: {field}")]
    UnsortedRepeatedField { field: String },

    /// A record claims an owner other than the snapshot's cluster
    #[error("record {service} has provenance {provenance}, snapshot belongs to {cluster}")]
    ForeignProvenance {
        service: String,
        provenance: String,
        cluster: String,
    },

    /// Record or tombstone newer than the snapshot carrying it
    #[error("entry {service} at version {version} exceeds snapshot version {snapshot}")]
    VersionAhead {
        service: String,
        version: u64,
        snapshot: u64,
    },
}
