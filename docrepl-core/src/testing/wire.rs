//! Sender-side encoding of replication messages

use crate::replication::items::{ReplicationItem, StreamDescriptor, content_hash};
use crate::replication::protocol::{Frame, FrameKind, OutgoingHeader};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Builds one documents message: header, items, then attachment streams
#[derive(Debug, Clone, Default)]
pub struct BatchBuilder {
    last_document_etag: i64,
    items: Vec<ReplicationItem>,
    streams: Vec<(StreamDescriptor, Bytes)>,
}

impl BatchBuilder {
    /// Empty batch claiming `last_document_etag`
    pub fn new(last_document_etag: i64) -> Self {
        Self {
            last_document_etag,
            ..Default::default()
        }
    }

    /// Append an item
    pub fn item(mut self, item: ReplicationItem) -> Self {
        self.items.push(item);
        self
    }

    /// Append an attachment stream with its correct content hash
    pub fn stream(self, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = content_hash(&data);
        self.stream_with_hash(hash, data)
    }

    /// Append an attachment stream declaring an arbitrary hash
    pub fn stream_with_hash(mut self, hash: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let descriptor = StreamDescriptor {
            hash: hash.into(),
            length: data.len() as u64,
        };
        self.streams.push((descriptor, data));
        self
    }

    /// Header that announces exactly the appended items and streams
    pub fn header(&self) -> OutgoingHeader {
        OutgoingHeader::documents(self.last_document_etag, self.items.len(), self.streams.len())
    }

    /// Encode under an explicit header, which may disagree with the body
    pub fn encode_with_header(&self, header: &OutgoingHeader) -> Bytes {
        let mut buf = BytesMut::new();
        let header = Frame::json(header).expect("header serializes");
        buf.put_slice(&header.encode());

        for item in &self.items {
            buf.put_slice(&Frame::new(FrameKind::Item, item.encode()).encode());
        }
        for (descriptor, data) in &self.streams {
            buf.put_slice(&Frame::new(FrameKind::AttachmentStream, descriptor.encode()).encode());
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Encode the whole message
    pub fn encode(&self) -> Bytes {
        self.encode_with_header(&self.header())
    }

    /// Write the whole message
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

/// Encoded heartbeat message
pub fn heartbeat_frame(last_document_etag: i64) -> Bytes {
    Frame::json(&OutgoingHeader::heartbeat(last_document_etag))
        .expect("header serializes")
        .encode()
}

/// Encoded empty message frame
pub fn poll_frame() -> Bytes {
    Frame::new(FrameKind::Message, Bytes::new()).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::config::ReplicationConfig;
    use crate::replication::protocol::IncomingMessage;
    use crate::replication::reader::WireReader;
    use crate::testing::items;

    #[tokio::test]
    async fn test_builder_output_reads_back() {
        let batch = BatchBuilder::new(5)
            .item(items::document("users/1", "A:5-dbA", 5))
            .item(items::attachment("users/1", "a.bin", b"xyz", "A:5-dbA", 5))
            .stream(&b"xyz"[..]);
        let encoded = batch.encode();

        let mut reader = WireReader::new(&encoded[..], &ReplicationConfig::default()).unwrap();
        let IncomingMessage::Documents(header) = reader.read_message().await.unwrap() else {
            panic!("expected a documents header");
        };
        assert_eq!(header.items_count, 2);
        assert_eq!(header.attachment_streams_count, 1);

        let read = reader.read_batch(&header).await.unwrap();
        assert_eq!(read.items.len(), 2);
        assert_eq!(
            reader.load_stream(&read.streams[0]).await.unwrap(),
            Bytes::from_static(b"xyz")
        );
    }
}
