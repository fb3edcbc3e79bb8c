//! Per-connection attachment spool
//!
//! Raw attachment payloads are copied from the socket into an anonymous temp
//! file while their digest is computed. Each spooled stream remembers its own
//! region of the file, so copies handed to partitions never depend on where the
//! file cursor happens to be.

use crate::replication::items::StreamDescriptor;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const COPY_CHUNK: usize = 64 * 1024;

/// Location of one spooled payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledStream {
    /// Verified content hash
    pub hash: String,
    /// Start of the payload in the spool file
    pub offset: u64,
    /// Payload length
    pub len: u64,
}

/// Temp-file backed spool, reset between batches
pub struct AttachmentSpool {
    file: File,
    len: u64,
    max_attachment_size: u64,
}

impl AttachmentSpool {
    /// Create a spool backed by an anonymous temp file
    pub fn new(max_attachment_size: u64) -> Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            file: File::from_std(file),
            len: 0,
            max_attachment_size,
        })
    }

    /// Bytes currently spooled
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing is spooled
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy exactly `descriptor.length` payload bytes from `reader` and verify their hash
    pub async fn spool_from<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        descriptor: &StreamDescriptor,
    ) -> Result<SpooledStream> {
        if descriptor.length > self.max_attachment_size {
            return Err(Error::protocol(format!(
                "Attachment {} of {} bytes exceeds the {} byte limit",
                descriptor.hash, descriptor.length, self.max_attachment_size
            )));
        }

        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut hasher = Sha256::new();
        let mut remaining = descriptor.length;
        let mut chunk = vec![0u8; COPY_CHUNK.min(remaining as usize).max(1)];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            reader
                .read_exact(&mut chunk[..want])
                .await
                .map_err(|e| Error::Io(e).truncated("attachment stream"))?;
            hasher.update(&chunk[..want]);
            self.file.write_all(&chunk[..want]).await?;
            remaining -= want as u64;
        }
        self.file.flush().await?;
        self.len += descriptor.length;

        let actual = STANDARD.encode(hasher.finalize());
        if actual != descriptor.hash {
            return Err(Error::protocol(format!(
                "Attachment stream hash mismatch: declared {}, computed {}",
                descriptor.hash, actual
            )));
        }

        Ok(SpooledStream {
            hash: actual,
            offset,
            len: descriptor.length,
        })
    }

    /// Read a spooled payload back into memory
    pub async fn read(&mut self, stream: &SpooledStream) -> Result<Bytes> {
        if stream.offset + stream.len > self.len {
            return Err(Error::internal(format!(
                "Spooled stream {} lies outside the spool ({} + {} > {})",
                stream.hash, stream.offset, stream.len, self.len
            )));
        }

        self.file.seek(SeekFrom::Start(stream.offset)).await?;
        let mut buf = BytesMut::zeroed(stream.len as usize);
        self.file.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Discard all spooled payloads
    pub async fn reset(&mut self) -> Result<()> {
        if self.len > 0 {
            self.file.set_len(0).await?;
            self.file.seek(SeekFrom::Start(0)).await?;
            self.len = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::items::content_hash;

    fn descriptor(data: &[u8]) -> StreamDescriptor {
        StreamDescriptor {
            hash: content_hash(data),
            length: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_spool_and_read_regions() {
        let mut spool = AttachmentSpool::new(1024).unwrap();
        let first = b"first payload".to_vec();
        let second = b"second".to_vec();

        let mut wire = Vec::new();
        wire.extend_from_slice(&first);
        wire.extend_from_slice(&second);
        let mut reader = &wire[..];

        let a = spool.spool_from(&mut reader, &descriptor(&first)).await.unwrap();
        let b = spool.spool_from(&mut reader, &descriptor(&second)).await.unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, first.len() as u64);
        assert!(reader.is_empty());

        // Regions are independent of read order
        assert_eq!(spool.read(&b).await.unwrap().as_ref(), &second[..]);
        assert_eq!(spool.read(&a).await.unwrap().as_ref(), &first[..]);
        assert_eq!(spool.read(&b).await.unwrap().as_ref(), &second[..]);
    }

    #[tokio::test]
    async fn test_hash_mismatch() {
        let mut spool = AttachmentSpool::new(1024).unwrap();
        let bad = StreamDescriptor {
            hash: content_hash(b"something else"),
            length: 4,
        };
        let mut reader = &b"data"[..];
        let err = spool.spool_from(&mut reader, &bad).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[tokio::test]
    async fn test_oversized_attachment() {
        let mut spool = AttachmentSpool::new(2).unwrap();
        let mut reader = &b"data"[..];
        let err = spool
            .spool_from(&mut reader, &descriptor(b"data"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_short_payload_is_truncated() {
        let mut spool = AttachmentSpool::new(1024).unwrap();
        let mut reader = &b"da"[..];
        let err = spool
            .spool_from(&mut reader, &descriptor(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("Truncated attachment stream"));
    }

    #[tokio::test]
    async fn test_reset() {
        let mut spool = AttachmentSpool::new(1024).unwrap();
        let mut reader = &b"abc"[..];
        let stream = spool.spool_from(&mut reader, &descriptor(b"abc")).await.unwrap();
        assert_eq!(spool.len(), 3);

        spool.reset().await.unwrap();
        assert!(spool.is_empty());
        assert!(spool.read(&stream).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let mut spool = AttachmentSpool::new(1024).unwrap();
        let mut reader = &b""[..];
        let stream = spool.spool_from(&mut reader, &descriptor(b"")).await.unwrap();
        assert_eq!(stream.len, 0);
        assert!(spool.read(&stream).await.unwrap().is_empty());
    }
}
