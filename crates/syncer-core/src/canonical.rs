//! Canonical encoding for snapshot checksums
//!
//! All checksummed objects use postcard serialization with strict constraints:
//! - Maps are `BTreeMap` (sorted by key)
//! - Repeated fields must be sorted and deduped
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for checksum computation.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Normalize a service record: instances sorted by id, endpoints sorted and deduped.
pub fn normalize_record(record: &mut ServiceRecord) {
    for instance in &mut record.instances {
        instance.endpoints.sort();
        instance.endpoints.dedup();
    }
    record.instances.sort();
    record
        .instances
        .dedup_by(|a, b| a.instance_id == b.instance_id);
}

/// Normalize a snapshot body: records and tombstones sorted by service id.
pub fn normalize_body(body: &mut SnapshotBody) {
    for record in &mut body.records {
        normalize_record(record);
    }
    body.records
        .sort_by(|a, b| a.service_id.cmp(&b.service_id));
    body.removed.sort();
}

/// Check that records are sorted by service id with no duplicates.
pub fn validate_records_sorted(records: &[ServiceRecord]) -> Result<()> {
    for i in 1..records.len() {
        if records[i].service_id <= records[i - 1].service_id {
            return Err(Error::UnsortedRepeatedField {
                field: "records".into(),
            });
        }
    }
    Ok(())
}

/// Check that tombstones are sorted by service id with no duplicates.
pub fn validate_removed_sorted(removed: &[Tombstone]) -> Result<()> {
    for i in 1..removed.len() {
        if removed[i].service_id <= removed[i - 1].service_id {
            return Err(Error::UnsortedRepeatedField {
                field: "removed".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_deterministic() {
        let record = ServiceRecord::new("svc1", ClusterId::new("dc1"))
            .with_attribute("b", "2")
            .with_attribute("a", "1");

        let bytes1 = canonical_bytes(&record).unwrap();
        let bytes2 = canonical_bytes(&record.clone()).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_normalize_record_sorts_instances() {
        let mut record = ServiceRecord::new("svc1", ClusterId::new("dc1"))
            .with_instance("i2", vec!["rest://b".into(), "rest://a".into(), "rest://a".into()])
            .with_instance("i1", vec![]);
        normalize_record(&mut record);

        assert_eq!(record.instances[0].instance_id, "i1");
        assert_eq!(record.instances[1].endpoints, vec!["rest://a", "rest://b"]);
    }

    #[test]
    fn test_records_sorting() {
        let dc = ClusterId::new("dc1");
        let unsorted = vec![
            ServiceRecord::new("b", dc.clone()),
            ServiceRecord::new("a", dc.clone()),
        ];
        assert!(validate_records_sorted(&unsorted).is_err());

        let mut body = SnapshotBody {
            cluster: dc,
            version: 1,
            kind: SnapshotKind::Full,
            records: unsorted,
            removed: vec![],
        };
        normalize_body(&mut body);
        assert!(validate_records_sorted(&body.records).is_ok());
    }
}
