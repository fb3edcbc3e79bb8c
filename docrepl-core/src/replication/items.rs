//! Replication items - one variant per change kind
//!
//! Every record read from the wire becomes exactly one [`ReplicationItem`]. The
//! set of kinds is closed: routing, deduplication and application all match on
//! it exhaustively.

use crate::replication::codec::{BodyReader, BodyWriter};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wire tag of a replication item
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Document
    Document = 1,
    /// Deleted document
    DocumentTombstone = 2,
    /// Attachment metadata
    Attachment = 3,
    /// Deleted attachment
    AttachmentTombstone = 4,
    /// Raw attachment payload
    AttachmentStream = 5,
    /// Counter group
    Counter = 6,
    /// Time-series segment
    TimeSeries = 7,
    /// Deleted time-series range
    TimeSeriesDeletedRange = 8,
    /// Deleted revision
    RevisionTombstone = 9,
}

impl TryFrom<u8> for ItemKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Document),
            2 => Ok(Self::DocumentTombstone),
            3 => Ok(Self::Attachment),
            4 => Ok(Self::AttachmentTombstone),
            5 => Ok(Self::AttachmentStream),
            6 => Ok(Self::Counter),
            7 => Ok(Self::TimeSeries),
            8 => Ok(Self::TimeSeriesDeletedRange),
            9 => Ok(Self::RevisionTombstone),
            _ => Err(Error::protocol(format!(
                "Unknown replication item type: {}",
                value
            ))),
        }
    }
}

impl ItemKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Document => "document item",
            Self::DocumentTombstone => "document tombstone item",
            Self::Attachment => "attachment item",
            Self::AttachmentTombstone => "attachment tombstone item",
            Self::AttachmentStream => "attachment stream item",
            Self::Counter => "counter item",
            Self::TimeSeries => "time-series item",
            Self::TimeSeriesDeletedRange => "time-series deleted range item",
            Self::RevisionTombstone => "revision tombstone item",
        }
    }
}

/// Attributes shared by every stored change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    /// Change vector of this change
    pub change_vector: String,
    /// Source etag of this change
    pub etag: i64,
    /// Last modification time on the source
    pub last_modified: DateTime<Utc>,
    /// Kind-specific flags
    pub flags: u32,
}

impl ItemHeader {
    /// Create a header with no flags
    pub fn new(change_vector: impl Into<String>, etag: i64, last_modified: DateTime<Utc>) -> Self {
        Self {
            change_vector: change_vector.into(),
            etag,
            last_modified,
            flags: 0,
        }
    }

    fn write(&self, w: &mut BodyWriter) {
        w.put_str(&self.change_vector)
            .put_i64(self.etag)
            .put_time(&self.last_modified)
            .put_u32(self.flags);
    }

    fn read(r: &mut BodyReader) -> Result<Self> {
        Ok(Self {
            change_vector: r.get_str()?,
            etag: r.get_i64()?,
            last_modified: r.get_time()?,
            flags: r.get_u32()?,
        })
    }
}

/// A single replicated change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationItem {
    /// Document put
    Document {
        /// Shared attributes
        header: ItemHeader,
        /// Document id
        id: String,
        /// Collection name
        collection: String,
        /// Document body
        data: Bytes,
    },
    /// Document delete
    DocumentTombstone {
        /// Shared attributes
        header: ItemHeader,
        /// Document id
        id: String,
        /// Collection name
        collection: String,
    },
    /// Attachment metadata; the payload arrives separately as a stream
    Attachment {
        /// Shared attributes
        header: ItemHeader,
        /// Owning document id
        document_id: String,
        /// Attachment name
        name: String,
        /// Content type
        content_type: String,
        /// Content hash, the deduplication key
        hash: String,
    },
    /// Attachment delete
    AttachmentTombstone {
        /// Shared attributes
        header: ItemHeader,
        /// Owning document id
        document_id: String,
        /// Attachment name
        name: String,
    },
    /// Attachment payload matched to its metadata by hash
    AttachmentStream {
        /// Content hash
        hash: String,
        /// Payload owned by one partition
        data: Bytes,
    },
    /// Counter group
    Counter {
        /// Shared attributes
        header: ItemHeader,
        /// Owning document id
        document_id: String,
        /// Counter group name
        name: String,
        /// Encoded counter values
        values: Bytes,
    },
    /// Time-series segment
    TimeSeries {
        /// Shared attributes
        header: ItemHeader,
        /// Owning document id
        document_id: String,
        /// Series name
        name: String,
        /// Collection of the owning document
        collection: String,
        /// Segment start
        baseline: DateTime<Utc>,
        /// Encoded segment
        segment: Bytes,
    },
    /// Deleted time-series range
    TimeSeriesDeletedRange {
        /// Shared attributes
        header: ItemHeader,
        /// Owning document id
        document_id: String,
        /// Series name
        name: String,
        /// Collection of the owning document
        collection: String,
        /// Range start
        from: DateTime<Utc>,
        /// Range end
        to: DateTime<Utc>,
    },
    /// Deleted revision; `id` is the change vector of the revision, not a document id
    RevisionTombstone {
        /// Shared attributes
        header: ItemHeader,
        /// Revision change vector
        id: String,
        /// Collection name
        collection: String,
    },
}

impl ReplicationItem {
    /// Wire tag of this item
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Document { .. } => ItemKind::Document,
            Self::DocumentTombstone { .. } => ItemKind::DocumentTombstone,
            Self::Attachment { .. } => ItemKind::Attachment,
            Self::AttachmentTombstone { .. } => ItemKind::AttachmentTombstone,
            Self::AttachmentStream { .. } => ItemKind::AttachmentStream,
            Self::Counter { .. } => ItemKind::Counter,
            Self::TimeSeries { .. } => ItemKind::TimeSeries,
            Self::TimeSeriesDeletedRange { .. } => ItemKind::TimeSeriesDeletedRange,
            Self::RevisionTombstone { .. } => ItemKind::RevisionTombstone,
        }
    }

    /// Shared attributes; streams carry none
    pub fn header(&self) -> Option<&ItemHeader> {
        match self {
            Self::Document { header, .. }
            | Self::DocumentTombstone { header, .. }
            | Self::Attachment { header, .. }
            | Self::AttachmentTombstone { header, .. }
            | Self::Counter { header, .. }
            | Self::TimeSeries { header, .. }
            | Self::TimeSeriesDeletedRange { header, .. }
            | Self::RevisionTombstone { header, .. } => Some(header),
            Self::AttachmentStream { .. } => None,
        }
    }

    /// Change vector of this change, empty for streams
    pub fn change_vector(&self) -> &str {
        self.header().map_or("", |h| h.change_vector.as_str())
    }

    /// Document that owns this change
    ///
    /// Revision tombstones and raw streams carry no recoverable document id.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Document { id, .. } | Self::DocumentTombstone { id, .. } => Some(id),
            Self::Attachment { document_id, .. }
            | Self::AttachmentTombstone { document_id, .. }
            | Self::Counter { document_id, .. }
            | Self::TimeSeries { document_id, .. }
            | Self::TimeSeriesDeletedRange { document_id, .. } => Some(document_id),
            Self::RevisionTombstone { .. } | Self::AttachmentStream { .. } => None,
        }
    }

    /// Content hash of attachment-bearing items
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::Attachment { hash, .. } | Self::AttachmentStream { hash, .. } => Some(hash),
            _ => None,
        }
    }

    /// Encode as an item record body: `[tag:1]` then the kind's fields
    pub fn encode(&self) -> Bytes {
        let mut w = BodyWriter::new();
        w.put_u8(self.kind() as u8);
        match self {
            Self::Document {
                header,
                id,
                collection,
                data,
            } => {
                header.write(&mut w);
                w.put_str(id).put_str(collection).put_blob(data);
            }
            Self::DocumentTombstone {
                header,
                id,
                collection,
            }
            | Self::RevisionTombstone {
                header,
                id,
                collection,
            } => {
                header.write(&mut w);
                w.put_str(id).put_str(collection);
            }
            Self::Attachment {
                header,
                document_id,
                name,
                content_type,
                hash,
            } => {
                header.write(&mut w);
                w.put_str(document_id)
                    .put_str(name)
                    .put_str(content_type)
                    .put_str(hash);
            }
            Self::AttachmentTombstone {
                header,
                document_id,
                name,
            } => {
                header.write(&mut w);
                w.put_str(document_id).put_str(name);
            }
            Self::AttachmentStream { hash, data } => {
                w.put_str(hash).put_u64(data.len() as u64);
            }
            Self::Counter {
                header,
                document_id,
                name,
                values,
            } => {
                header.write(&mut w);
                w.put_str(document_id).put_str(name).put_blob(values);
            }
            Self::TimeSeries {
                header,
                document_id,
                name,
                collection,
                baseline,
                segment,
            } => {
                header.write(&mut w);
                w.put_str(document_id)
                    .put_str(name)
                    .put_str(collection)
                    .put_time(baseline)
                    .put_blob(segment);
            }
            Self::TimeSeriesDeletedRange {
                header,
                document_id,
                name,
                collection,
                from,
                to,
            } => {
                header.write(&mut w);
                w.put_str(document_id)
                    .put_str(name)
                    .put_str(collection)
                    .put_time(from)
                    .put_time(to);
            }
        }
        w.finish()
    }

    /// Decode an item record body
    ///
    /// Attachment streams are not items: they use a separate frame and carry
    /// their payload outside the record, so their tag is rejected here.
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut r = BodyReader::new(body, "replication item");
        let kind = ItemKind::try_from(r.get_u8()?)?;
        let mut r = BodyReader::new(r.into_remaining(), kind.describe());

        let item = match kind {
            ItemKind::Document => Self::Document {
                header: ItemHeader::read(&mut r)?,
                id: r.get_str()?,
                collection: r.get_str()?,
                data: r.get_blob()?,
            },
            ItemKind::DocumentTombstone => Self::DocumentTombstone {
                header: ItemHeader::read(&mut r)?,
                id: r.get_str()?,
                collection: r.get_str()?,
            },
            ItemKind::Attachment => Self::Attachment {
                header: ItemHeader::read(&mut r)?,
                document_id: r.get_str()?,
                name: r.get_str()?,
                content_type: r.get_str()?,
                hash: r.get_str()?,
            },
            ItemKind::AttachmentTombstone => Self::AttachmentTombstone {
                header: ItemHeader::read(&mut r)?,
                document_id: r.get_str()?,
                name: r.get_str()?,
            },
            ItemKind::AttachmentStream => {
                return Err(Error::protocol(
                    "Attachment stream record found in the item section",
                ));
            }
            ItemKind::Counter => Self::Counter {
                header: ItemHeader::read(&mut r)?,
                document_id: r.get_str()?,
                name: r.get_str()?,
                values: r.get_blob()?,
            },
            ItemKind::TimeSeries => Self::TimeSeries {
                header: ItemHeader::read(&mut r)?,
                document_id: r.get_str()?,
                name: r.get_str()?,
                collection: r.get_str()?,
                baseline: r.get_time()?,
                segment: r.get_blob()?,
            },
            ItemKind::TimeSeriesDeletedRange => Self::TimeSeriesDeletedRange {
                header: ItemHeader::read(&mut r)?,
                document_id: r.get_str()?,
                name: r.get_str()?,
                collection: r.get_str()?,
                from: r.get_time()?,
                to: r.get_time()?,
            },
            ItemKind::RevisionTombstone => Self::RevisionTombstone {
                header: ItemHeader::read(&mut r)?,
                id: r.get_str()?,
                collection: r.get_str()?,
            },
        };

        r.finish()?;
        Ok(item)
    }
}

/// Header of a raw attachment payload: content hash and payload length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Content hash
    pub hash: String,
    /// Number of payload bytes following the descriptor
    pub length: u64,
}

impl StreamDescriptor {
    /// Encode as `[tag:1][hash][length:8]`
    pub fn encode(&self) -> Bytes {
        let mut w = BodyWriter::new();
        w.put_u8(ItemKind::AttachmentStream as u8)
            .put_str(&self.hash)
            .put_u64(self.length);
        w.finish()
    }

    /// Decode a stream descriptor; any other tag is a protocol violation
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut r = BodyReader::new(body, "attachment stream item");
        let kind = ItemKind::try_from(r.get_u8()?)?;
        if kind != ItemKind::AttachmentStream {
            return Err(Error::protocol(format!(
                "Expected an attachment stream record, got {:?}",
                kind
            )));
        }
        let descriptor = Self {
            hash: r.get_str()?,
            length: r.get_u64()?,
        };
        r.finish()?;
        Ok(descriptor)
    }
}

/// Content hash of an attachment payload: base64 of its SHA-256 digest
pub fn content_hash(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}
