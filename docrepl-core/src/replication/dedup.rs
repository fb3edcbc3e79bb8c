//! Attachment deduplication per destination partition
//!
//! Identical payloads are sent once per batch no matter how many documents
//! reference them. Each partition remembers the hashes its attachment items
//! reference; when the payload arrives every such partition gets its own copy.

use crate::replication::items::ReplicationItem;
use bytes::Bytes;
use std::collections::HashMap;

/// First attachment item seen for a hash in one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Owning document of the first reference
    pub document_id: String,
    /// Attachment name of the first reference
    pub name: String,
}

/// Content-hash → attachment mapping, one map per partition
#[derive(Debug, Clone)]
pub struct AttachmentDeduplicator {
    per_partition: Vec<HashMap<String, AttachmentRef>>,
}

impl AttachmentDeduplicator {
    /// Create empty maps for `partition_count` partitions
    pub fn new(partition_count: usize) -> Self {
        Self {
            per_partition: vec![HashMap::new(); partition_count],
        }
    }

    /// Record an item queued on `partition`
    ///
    /// Returns `true` the first time an attachment hash is seen for that partition.
    pub fn observe(&mut self, partition: usize, item: &ReplicationItem) -> bool {
        let ReplicationItem::Attachment {
            document_id,
            name,
            hash,
            ..
        } = item
        else {
            return false;
        };

        let Some(map) = self.per_partition.get_mut(partition) else {
            return false;
        };
        if map.contains_key(hash) {
            return false;
        }
        map.insert(
            hash.clone(),
            AttachmentRef {
                document_id: document_id.clone(),
                name: name.clone(),
            },
        );
        true
    }

    /// Whether `partition` references `hash`
    pub fn contains(&self, partition: usize, hash: &str) -> bool {
        self.per_partition
            .get(partition)
            .is_some_and(|map| map.contains_key(hash))
    }

    /// First reference to `hash` in `partition`
    pub fn get(&self, partition: usize, hash: &str) -> Option<&AttachmentRef> {
        self.per_partition.get(partition)?.get(hash)
    }

    /// Partitions that reference `hash`
    pub fn partitions_for(&self, hash: &str) -> Vec<usize> {
        self.per_partition
            .iter()
            .enumerate()
            .filter(|(_, map)| map.contains_key(hash))
            .map(|(partition, _)| partition)
            .collect()
    }

    /// Build one stream item per referencing partition, each owning a fresh copy of `data`
    pub fn attach_stream(&self, hash: &str, data: &[u8]) -> Vec<(usize, ReplicationItem)> {
        self.partitions_for(hash)
            .into_iter()
            .map(|partition| {
                (
                    partition,
                    ReplicationItem::AttachmentStream {
                        hash: hash.to_string(),
                        data: Bytes::copy_from_slice(data),
                    },
                )
            })
            .collect()
    }

    /// Forget every hash
    pub fn clear(&mut self) {
        for map in &mut self.per_partition {
            map.clear();
        }
    }

    /// Number of distinct (partition, hash) pairs
    pub fn len(&self) -> usize {
        self.per_partition.iter().map(HashMap::len).sum()
    }

    /// Whether no hash is recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::items::ItemHeader;
    use chrono::{DateTime, Utc};

    fn attachment(doc: &str, hash: &str) -> ReplicationItem {
        ReplicationItem::Attachment {
            header: ItemHeader::new("A:1-dbA", 1, DateTime::<Utc>::from_timestamp_millis(0).unwrap()),
            document_id: doc.into(),
            name: "a.txt".into(),
            content_type: "text/plain".into(),
            hash: hash.into(),
        }
    }

    #[test]
    fn test_first_sight_per_partition() {
        let mut dedup = AttachmentDeduplicator::new(2);
        assert!(dedup.observe(0, &attachment("users/1", "h1")));
        assert!(!dedup.observe(0, &attachment("users/2", "h1")));
        assert!(dedup.observe(1, &attachment("users/3", "h1")));

        assert_eq!(dedup.get(0, "h1").unwrap().document_id, "users/1");
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_non_attachment_items_ignored() {
        let mut dedup = AttachmentDeduplicator::new(1);
        let tombstone = ReplicationItem::AttachmentTombstone {
            header: ItemHeader::new("A:1-dbA", 1, DateTime::<Utc>::from_timestamp_millis(0).unwrap()),
            document_id: "users/1".into(),
            name: "a.txt".into(),
        };
        assert!(!dedup.observe(0, &tombstone));
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_stream_copied_into_every_referencing_partition() {
        let mut dedup = AttachmentDeduplicator::new(3);
        dedup.observe(0, &attachment("users/1", "h"));
        dedup.observe(2, &attachment("users/2", "h"));

        let copies = dedup.attach_stream("h", b"payload");
        let partitions: Vec<_> = copies.iter().map(|(p, _)| *p).collect();
        assert_eq!(partitions, vec![0, 2]);

        let buffers: Vec<_> = copies
            .iter()
            .map(|(_, item)| match item {
                ReplicationItem::AttachmentStream { data, .. } => data.clone(),
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        assert_eq!(buffers[0], buffers[1]);
        assert_ne!(buffers[0].as_ptr(), buffers[1].as_ptr());
    }

    #[test]
    fn test_unreferenced_stream() {
        let dedup = AttachmentDeduplicator::new(2);
        assert!(dedup.attach_stream("nobody", b"x").is_empty());
    }

    #[test]
    fn test_clear() {
        let mut dedup = AttachmentDeduplicator::new(2);
        dedup.observe(1, &attachment("users/1", "h"));
        dedup.clear();
        assert!(!dedup.contains(1, "h"));
        assert!(dedup.is_empty());
    }
}
