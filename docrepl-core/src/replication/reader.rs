//! Wire reader
//!
//! Turns the framed byte stream of one connection into messages, typed
//! replication items and spooled attachment payloads. Record decoding is
//! delegated to [`ReplicationItem::decode`]; this module owns framing, limits
//! and the item/stream section order of a batch.

use crate::replication::config::ReplicationConfig;
use crate::replication::items::{ReplicationItem, StreamDescriptor};
use crate::replication::protocol::{BatchHeader, Frame, FrameKind, IncomingMessage};
use crate::replication::spool::{AttachmentSpool, SpooledStream};
use crate::Result;
use bytes::Bytes;
use tokio::io::AsyncRead;

/// Everything a documents message carried, in wire order
#[derive(Debug, Default)]
pub struct IncomingBatch {
    /// Typed records of the item section
    pub items: Vec<ReplicationItem>,
    /// Payloads of the stream section, still in the spool
    pub streams: Vec<SpooledStream>,
}

/// Reads frames off one connection
pub struct WireReader<R> {
    stream: R,
    max_frame_size: usize,
    spool: AttachmentSpool,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    /// Wrap the read side of a connection
    pub fn new(stream: R, config: &ReplicationConfig) -> Result<Self> {
        Ok(Self {
            stream,
            max_frame_size: config.max_frame_size,
            spool: AttachmentSpool::new(config.max_attachment_size)?,
        })
    }

    /// Read the next message header
    pub async fn read_message(&mut self) -> Result<IncomingMessage> {
        let frame = Frame::read_from(&mut self.stream, self.max_frame_size)
            .await?
            .expect_kind(FrameKind::Message)?;
        IncomingMessage::parse(&frame.payload)
    }

    /// Read one record of the item section
    pub async fn read_item(&mut self) -> Result<ReplicationItem> {
        let frame = Frame::read_from(&mut self.stream, self.max_frame_size)
            .await?
            .expect_kind(FrameKind::Item)?;
        ReplicationItem::decode(frame.payload)
    }

    /// Read one descriptor of the stream section and spool its payload
    pub async fn read_stream(&mut self) -> Result<SpooledStream> {
        let frame = Frame::read_from(&mut self.stream, self.max_frame_size)
            .await?
            .expect_kind(FrameKind::AttachmentStream)?;
        let descriptor = StreamDescriptor::decode(frame.payload)?;
        self.spool.spool_from(&mut self.stream, &descriptor).await
    }

    /// Read exactly the declared number of items, then the declared number of streams
    ///
    /// The stream ending before every declared record arrived is a protocol
    /// violation, not a network fault.
    pub async fn read_batch(&mut self, header: &BatchHeader) -> Result<IncomingBatch> {
        self.spool.reset().await?;

        let mut batch = IncomingBatch {
            items: Vec::with_capacity(header.items_count),
            streams: Vec::with_capacity(header.attachment_streams_count),
        };

        for _ in 0..header.items_count {
            let item = self.read_item().await.map_err(|e| e.truncated("batch"))?;
            batch.items.push(item);
        }

        for _ in 0..header.attachment_streams_count {
            let stream = self.read_stream().await.map_err(|e| e.truncated("batch"))?;
            batch.streams.push(stream);
        }

        Ok(batch)
    }

    /// Load a spooled payload of the current batch
    pub async fn load_stream(&mut self, stream: &SpooledStream) -> Result<Bytes> {
        self.spool.read(stream).await
    }

    /// Underlying stream
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.stream
    }
}
