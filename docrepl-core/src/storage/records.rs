//! Persisted record layouts (bincode encoded)

use crate::Result;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encode a record for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Encode a record into a reusable buffer, replacing its contents
pub fn encode_into<T: Serialize>(buf: &mut BytesMut, value: &T) -> Result<()> {
    buf.clear();
    bincode::serialize_into(buf.writer(), value)?;
    Ok(())
}

/// Decode a stored record
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(raw)?)
}

/// Live document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Original-case document id
    pub id: String,
    /// Collection name
    pub collection: String,
    /// Document body
    pub data: Vec<u8>,
    /// Document flags
    pub flags: u32,
    /// Change vector of the stored version
    pub change_vector: String,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
}

/// Deleted document or revision marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    /// Original-case id
    pub id: String,
    /// Collection name
    pub collection: String,
    /// Flags carried over from the deleted document
    pub flags: u32,
    /// Change vector of the deletion
    pub change_vector: String,
    /// Deletion time
    pub last_modified: DateTime<Utc>,
}

/// Attachment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Owning document id
    pub document_id: String,
    /// Attachment name
    pub name: String,
    /// Content type
    pub content_type: String,
    /// Content hash, key into the blob table
    pub hash: String,
    /// Change vector of this attachment version
    pub change_vector: String,
}

/// Counter group of one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Owning document id
    pub document_id: String,
    /// Counter group name
    pub name: String,
    /// Encoded counter values
    pub values: Vec<u8>,
    /// Change vector of this counter group
    pub change_vector: String,
}

/// Time-series segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    /// Owning document id
    pub document_id: String,
    /// Series name
    pub name: String,
    /// Collection of the owning document
    pub collection: String,
    /// Segment start
    pub baseline: DateTime<Utc>,
    /// Encoded segment
    pub segment: Vec<u8>,
    /// Change vector of this segment
    pub change_vector: String,
}

/// Deleted time-series range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRangeRecord {
    /// Owning document id
    pub document_id: String,
    /// Series name
    pub name: String,
    /// Collection of the owning document
    pub collection: String,
    /// Range start
    pub from: DateTime<Utc>,
    /// Range end
    pub to: DateTime<Utc>,
    /// Change vector of the deletion
    pub change_vector: String,
}

/// Records that carry the change vector of their stored version
pub trait Versioned {
    /// Stored change vector
    fn change_vector(&self) -> &str;
}

macro_rules! impl_versioned {
    ($($record:ty),* $(,)?) => {
        $(
            impl Versioned for $record {
                fn change_vector(&self) -> &str {
                    &self.change_vector
                }
            }
        )*
    };
}

impl_versioned!(
    DocumentRecord,
    TombstoneRecord,
    AttachmentRecord,
    CounterRecord,
    TimeSeriesRecord,
    DeletedRangeRecord,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_into_reuses_buffer() {
        let record = CounterRecord {
            document_id: "users/1".into(),
            name: "likes".into(),
            values: vec![1, 2, 3],
            change_vector: "A:1-dbA".into(),
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"stale");
        encode_into(&mut buf, &record).unwrap();

        assert_eq!(&buf[..], &encode(&record).unwrap()[..]);
        let back: CounterRecord = decode(&buf).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.change_vector(), "A:1-dbA");
    }
}
