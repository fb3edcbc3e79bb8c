//! Incoming replication wire protocol
//!
//! Every unit on the wire is a CRC32-validated frame:
//!
//! ```text
//! [kind:1][length:4][payload:N][crc32:4]
//! ```
//!
//! `Message` frames carry a JSON header (or reply), `Item` frames one typed
//! record, and `AttachmentStream` frames a stream descriptor that is followed by
//! the raw payload bytes outside the frame.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: kind(1) + length(4)
const FRAME_HEADER_LEN: usize = 5;

/// `MessageType` of the reply to an empty poll frame
pub const NOTIFY_MESSAGE_TYPE: &str = "Notify";

/// `MessageType` used when the failing message could not be identified
pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown";

/// Frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON message header or reply
    Message = 0x01,
    /// Typed replication record
    Item = 0x02,
    /// Attachment stream descriptor
    AttachmentStream = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Message),
            0x02 => Ok(Self::Item),
            0x03 => Ok(Self::AttachmentStream),
            _ => Err(Error::protocol(format!("Unknown frame kind: {}", value))),
        }
    }
}

/// One framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Create a message frame from a serializable header
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(FrameKind::Message, Bytes::from(payload)))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len() + 4);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // CRC32 of kind + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.put_u32_le(crc);

        buf.freeze()
    }

    /// Write frame to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read frame from async stream, rejecting payloads above `max_frame_size`
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Self> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let kind = FrameKind::try_from(header[0])?;
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if length > max_frame_size {
            return Err(Error::protocol(format!(
                "Frame of {} bytes exceeds the {} byte limit",
                length, max_frame_size
            )));
        }

        // Read payload + CRC
        let mut body = vec![0u8; length + 4];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::Io(e).truncated("frame"))?;

        let stored_crc = u32::from_le_bytes([
            body[length],
            body[length + 1],
            body[length + 2],
            body[length + 3],
        ]);
        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&body[..length]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        body.truncate(length);
        Ok(Self::new(kind, Bytes::from(body)))
    }

    /// Require a specific kind
    pub fn expect_kind(self, kind: FrameKind) -> Result<Self> {
        if self.kind != kind {
            return Err(Error::protocol(format!(
                "Expected a {:?} frame, got {:?}",
                kind, self.kind
            )));
        }
        Ok(self)
    }
}

/// Wire shape of a message header; every field is checked explicitly
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMessageHeader {
    r#type: Option<String>,
    last_document_etag: Option<i64>,
    items_count: Option<i64>,
    attachment_streams_count: Option<i64>,
}

/// Header of a documents batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// Sender's highest sent etag
    pub last_document_etag: i64,
    /// Number of item frames that follow
    pub items_count: usize,
    /// Number of attachment streams that follow the items
    pub attachment_streams_count: usize,
}

impl BatchHeader {
    /// Reject counts above the configured limits
    pub fn check_limits(&self, max_items: usize, max_streams: usize) -> Result<()> {
        if self.items_count > max_items {
            return Err(Error::protocol(format!(
                "ItemsCount {} exceeds the limit of {}",
                self.items_count, max_items
            )));
        }
        if self.attachment_streams_count > max_streams {
            return Err(Error::protocol(format!(
                "AttachmentStreamsCount {} exceeds the limit of {}",
                self.attachment_streams_count, max_streams
            )));
        }
        Ok(())
    }
}

/// A decoded incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingMessage {
    /// Empty frame: the sender asks for our last accepted etag
    Poll,
    /// Keep-alive carrying the sender's position
    Heartbeat {
        /// Sender's highest sent etag
        last_document_etag: i64,
    },
    /// A batch of items follows
    Documents(BatchHeader),
}

impl IncomingMessage {
    /// `Type` value of documents messages
    pub const DOCUMENTS: &'static str = "Documents";
    /// `Type` value of heartbeat messages
    pub const HEARTBEAT: &'static str = "Heartbeat";

    /// Parse a message frame payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self::Poll);
        }

        let raw: RawMessageHeader = serde_json::from_slice(payload)
            .map_err(|e| Error::protocol(format!("Malformed message header: {}", e)))?;

        let message_type = raw
            .r#type
            .ok_or_else(|| Error::protocol("Missing 'Type' field in message header"))?;
        let last_document_etag = raw
            .last_document_etag
            .ok_or_else(|| Error::protocol("Missing 'LastDocumentEtag' field in message header"))?;

        match message_type.as_str() {
            Self::DOCUMENTS => {
                let items_count = required_count(raw.items_count, "ItemsCount")?;
                let attachment_streams_count =
                    required_count(raw.attachment_streams_count, "AttachmentStreamsCount")?;
                Ok(Self::Documents(BatchHeader {
                    last_document_etag,
                    items_count,
                    attachment_streams_count,
                }))
            }
            Self::HEARTBEAT => Ok(Self::Heartbeat { last_document_etag }),
            other => Err(Error::protocol(format!("Unknown message type: {}", other))),
        }
    }

    /// `MessageType` echoed in the reply
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Poll => NOTIFY_MESSAGE_TYPE,
            Self::Heartbeat { .. } => Self::HEARTBEAT,
            Self::Documents(_) => Self::DOCUMENTS,
        }
    }
}

fn required_count(value: Option<i64>, field: &str) -> Result<usize> {
    let value =
        value.ok_or_else(|| Error::protocol(format!("Missing '{}' field in message header", field)))?;
    usize::try_from(value)
        .map_err(|_| Error::protocol(format!("'{}' must not be negative, got {}", field, value)))
}

/// Outgoing message header, as produced by a sending node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutgoingHeader {
    /// `Documents` or `Heartbeat`
    pub r#type: String,
    /// Sender's highest sent etag
    pub last_document_etag: i64,
    /// Present on documents messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_count: Option<usize>,
    /// Present on documents messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_streams_count: Option<usize>,
}

impl OutgoingHeader {
    /// Documents batch header
    pub fn documents(last_document_etag: i64, items: usize, streams: usize) -> Self {
        Self {
            r#type: IncomingMessage::DOCUMENTS.to_string(),
            last_document_etag,
            items_count: Some(items),
            attachment_streams_count: Some(streams),
        }
    }

    /// Heartbeat header
    pub fn heartbeat(last_document_etag: i64) -> Self {
        Self {
            r#type: IncomingMessage::HEARTBEAT.to_string(),
            last_document_etag,
            items_count: None,
            attachment_streams_count: None,
        }
    }
}

/// Reply kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyType {
    /// Batch applied, or heartbeat acknowledged
    Ok,
    /// Batch rejected; resend it with the attachment streams
    MissingAttachments,
    /// Batch failed; the connection is closed after this reply
    Error,
}

/// Reply written back for every handled message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationReply {
    /// Reply kind
    pub r#type: ReplyType,
    /// Type of the message being answered
    pub message_type: String,
    /// Last etag accepted from the sender, -1 on failure
    pub last_etag_accepted: i64,
    /// Failure text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Responding node's tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_tag: Option<String>,
}

impl ReplicationReply {
    /// Successful reply
    pub fn ok(message_type: &str, last_etag_accepted: i64, node_tag: &str) -> Self {
        Self {
            r#type: ReplyType::Ok,
            message_type: message_type.to_string(),
            last_etag_accepted,
            exception: None,
            node_tag: Some(node_tag.to_string()),
        }
    }

    /// Typed negative ack for a batch whose attachments were not all present
    ///
    /// `exception` names the missing payload so the sender can log it.
    pub fn missing_attachments(message_type: &str, exception: impl Into<String>) -> Self {
        Self {
            r#type: ReplyType::MissingAttachments,
            message_type: message_type.to_string(),
            last_etag_accepted: -1,
            exception: Some(exception.into()),
            node_tag: None,
        }
    }

    /// Failure reply
    pub fn error(message_type: &str, exception: impl Into<String>) -> Self {
        Self {
            r#type: ReplyType::Error,
            message_type: message_type.to_string(),
            last_etag_accepted: -1,
            exception: Some(exception.into()),
            node_tag: None,
        }
    }

    /// Write this reply as a message frame
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        Frame::json(self)?.write_to(writer).await
    }

    /// Read a reply frame
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_frame_size: usize,
    ) -> Result<Self> {
        let frame = Frame::read_from(reader, max_frame_size)
            .await?
            .expect_kind(FrameKind::Message)?;
        serde_json::from_slice(&frame.payload)
            .map_err(|e| Error::protocol(format!("Malformed reply: {}", e)))
    }
}
