//! Snapshot checksums
//!
//! Checksums use BLAKE3 with a domain separation prefix over the canonical
//! bytes of the snapshot body.

use crate::canonical::{
    canonical_bytes, normalize_body, validate_records_sorted, validate_removed_sorted,
};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;

/// Domain prefix for snapshot checksums
pub const DOMAIN_SNAPSHOT: &[u8] = b"sc-sync-snapshot-v1";

/// Compute the checksum of a snapshot body.
///
/// `checksum = BLAKE3("sc-sync-snapshot-v1" || canonical_bytes(body))`
pub fn snapshot_checksum(body: &SnapshotBody) -> Result<Bytes32> {
    let bytes = canonical_bytes(body)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SNAPSHOT);
    hasher.update(&bytes);

    Ok(*hasher.finalize().as_bytes())
}

/// Normalize a body and seal it into an immutable, checksummed snapshot.
pub fn seal_snapshot(mut body: SnapshotBody) -> Result<Snapshot> {
    normalize_body(&mut body);
    let checksum = snapshot_checksum(&body)?;
    Ok(Snapshot { body, checksum })
}

/// Verify a received snapshot before merging it.
///
/// Checks, in order: the checksum matches the declared contents, repeated
/// fields are canonical, every record is owned by the snapshot's cluster,
/// and no entry is newer than the snapshot itself.
pub fn verify_snapshot(snapshot: &Snapshot) -> Result<()> {
    let computed = snapshot_checksum(&snapshot.body)?;
    if computed != snapshot.checksum {
        return Err(Error::ChecksumMismatch {
            computed: hex::encode(computed),
            transmitted: hex::encode(snapshot.checksum),
        });
    }

    validate_records_sorted(&snapshot.body.records)?;
    validate_removed_sorted(&snapshot.body.removed)?;

    let cluster = &snapshot.body.cluster;
    let version = snapshot.body.version;
    for record in &snapshot.body.records {
        if &record.provenance != cluster {
            return Err(Error::ForeignProvenance {
                service: record.service_id.to_string(),
                provenance: record.provenance.to_string(),
                cluster: cluster.to_string(),
            });
        }
        if record.version > version {
            return Err(Error::VersionAhead {
                service: record.service_id.to_string(),
                version: record.version,
                snapshot: version,
            });
        }
    }
    for tombstone in &snapshot.body.removed {
        if tombstone.version > version {
            return Err(Error::VersionAhead {
                service: tombstone.service_id.to_string(),
                version: tombstone.version,
                snapshot: version,
            });
        }
    }
    Ok(())
}
