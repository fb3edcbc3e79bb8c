//! Shard router
//!
//! Maps every replication item to the partition owning its document. The hash
//! is xxh3 over the lowercased document id, so routing is stable across
//! processes and independent of id casing.

use crate::replication::items::ReplicationItem;
use crate::{Error, Result};
use xxhash_rust::xxh3::xxh3_64;

/// Deterministic item → partition mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    partition_count: usize,
}

impl ShardRouter {
    /// Create a router over `partition_count` partitions
    pub fn new(partition_count: usize) -> Result<Self> {
        if partition_count == 0 {
            return Err(Error::config("partition_count must be at least 1"));
        }
        Ok(Self { partition_count })
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Partition owning a document id
    pub fn partition_for_key(&self, document_id: &str) -> usize {
        let hash = xxh3_64(document_id.to_lowercase().as_bytes());
        (hash % self.partition_count as u64) as usize
    }

    /// Partition owning an item
    pub fn route(&self, item: &ReplicationItem) -> Result<usize> {
        match item {
            // A single partition needs no key
            ReplicationItem::RevisionTombstone { .. } if self.partition_count == 1 => Ok(0),
            ReplicationItem::RevisionTombstone { id, .. } => Err(Error::unsupported(format!(
                "Revision tombstone {} carries no document id and cannot be routed in sharded mode",
                id
            ))),
            ReplicationItem::AttachmentStream { hash, .. } => Err(Error::internal(format!(
                "Attachment stream {} is distributed by content hash, not routed",
                hash
            ))),
            ReplicationItem::Document { id, .. } | ReplicationItem::DocumentTombstone { id, .. } => {
                Ok(self.partition_for_key(id))
            }
            ReplicationItem::Attachment { document_id, .. }
            | ReplicationItem::AttachmentTombstone { document_id, .. }
            | ReplicationItem::Counter { document_id, .. }
            | ReplicationItem::TimeSeries { document_id, .. }
            | ReplicationItem::TimeSeriesDeletedRange { document_id, .. } => {
                Ok(self.partition_for_key(document_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::items::ItemHeader;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};

    fn header() -> ItemHeader {
        ItemHeader::new("A:1-dbA", 1, DateTime::<Utc>::from_timestamp_millis(0).unwrap())
    }

    fn document(id: &str) -> ReplicationItem {
        ReplicationItem::Document {
            header: header(),
            id: id.into(),
            collection: "Users".into(),
            data: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn test_zero_partitions() {
        assert!(ShardRouter::new(0).is_err());
    }

    #[test]
    fn test_route_is_deterministic() {
        let router = ShardRouter::new(8).unwrap();
        for i in 0..100 {
            let item = document(&format!("users/{}", i));
            let first = router.route(&item).unwrap();
            assert_eq!(router.route(&item).unwrap(), first);
            assert!(first < 8);
        }
    }

    #[test]
    fn test_case_insensitive() {
        let router = ShardRouter::new(16).unwrap();
        assert_eq!(
            router.partition_for_key("Users/42"),
            router.partition_for_key("users/42")
        );
    }

    #[test]
    fn test_related_items_follow_document() {
        let router = ShardRouter::new(7).unwrap();
        let doc = router.route(&document("orders/9")).unwrap();
        let counter = ReplicationItem::Counter {
            header: header(),
            document_id: "ORDERS/9".into(),
            name: "views".into(),
            values: Bytes::new(),
        };
        assert_eq!(router.route(&counter).unwrap(), doc);
    }

    #[test]
    fn test_single_partition() {
        let router = ShardRouter::new(1).unwrap();
        assert_eq!(router.route(&document("anything")).unwrap(), 0);
    }

    #[test]
    fn test_revision_tombstone_unsupported() {
        let router = ShardRouter::new(4).unwrap();
        let item = ReplicationItem::RevisionTombstone {
            header: header(),
            id: "A:5-dbA".into(),
            collection: "Users".into(),
        };
        let err = router.route(&item).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let unsharded = ShardRouter::new(1).unwrap();
        assert_eq!(unsharded.route(&item).unwrap(), 0);
    }
}
