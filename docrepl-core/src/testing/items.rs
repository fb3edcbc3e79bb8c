//! Replication item builders

use crate::replication::items::{ItemHeader, ReplicationItem, content_hash};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Fixed modification time used by the builders
pub fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).expect("timestamp in range")
}

fn header(change_vector: &str, etag: i64) -> ItemHeader {
    ItemHeader::new(change_vector, etag, timestamp(1_700_000_000_000 + etag))
}

/// Document in collection `Users` with a small JSON body
pub fn document(id: &str, change_vector: &str, etag: i64) -> ReplicationItem {
    ReplicationItem::Document {
        header: header(change_vector, etag),
        id: id.to_string(),
        collection: "Users".to_string(),
        data: Bytes::from(format!(r#"{{"Name":"{}","Etag":{}}}"#, id, etag)),
    }
}

/// Tombstone of a document in collection `Users`
pub fn tombstone(id: &str, change_vector: &str, etag: i64) -> ReplicationItem {
    ReplicationItem::DocumentTombstone {
        header: header(change_vector, etag),
        id: id.to_string(),
        collection: "Users".to_string(),
    }
}

/// Attachment metadata referencing `data` by content hash
pub fn attachment(
    document_id: &str,
    name: &str,
    data: &[u8],
    change_vector: &str,
    etag: i64,
) -> ReplicationItem {
    ReplicationItem::Attachment {
        header: header(change_vector, etag),
        document_id: document_id.to_string(),
        name: name.to_string(),
        content_type: "application/octet-stream".to_string(),
        hash: content_hash(data),
    }
}

/// Counter group with opaque encoded values
pub fn counter(document_id: &str, name: &str, change_vector: &str, etag: i64) -> ReplicationItem {
    ReplicationItem::Counter {
        header: header(change_vector, etag),
        document_id: document_id.to_string(),
        name: name.to_string(),
        values: Bytes::from(etag.to_le_bytes().to_vec()),
    }
}

/// Revision tombstone keyed by its change vector
pub fn revision_tombstone(change_vector: &str, etag: i64) -> ReplicationItem {
    ReplicationItem::RevisionTombstone {
        header: header(change_vector, etag),
        id: change_vector.to_string(),
        collection: "Users".to_string(),
    }
}
