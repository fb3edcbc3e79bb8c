//! Incoming replication connection handler
//!
//! Owns one connection from a sending node:
//!
//! ```text
//! Connected ─► ReadingMessage ─┬─► Heartbeat ──────┬─► Acking ─► ReadingMessage ...
//!                              └─► DocumentsBatch ─┘
//!                   any fatal fault or cancellation ─► Closed
//! ```
//!
//! A documents batch is read completely, routed into the per-partition queue,
//! handed to the partition workers and only acknowledged after the completion
//! barrier resolved. The next message is not read before that, so at most one
//! batch per connection is ever in flight.
//!
//! Failure policy:
//! - missing attachment: `MissingAttachments` reply naming the payload,
//!   connection stays open
//! - socket fault: logged, no reply, error returned so the peer reconnects
//! - anything else: `Error` reply, then the error is returned
//! - cancellation: the loop exits without a reply

use crate::replication::config::ReplicationConfig;
use crate::replication::partition::PartitionWorkers;
use crate::replication::protocol::{
    BatchHeader, IncomingMessage, ReplicationReply, UNKNOWN_MESSAGE_TYPE,
};
use crate::replication::queue::ReplicationQueue;
use crate::replication::reader::WireReader;
use crate::replication::registry::ConnectionActivity;
use crate::replication::router::ShardRouter;
use crate::transaction::AppliedSlice;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Created, loop not started
    Connected,
    /// Waiting for the next message header
    ReadingMessage,
    /// Handling a heartbeat or poll
    Heartbeat,
    /// Reading and applying a documents batch
    DocumentsBatch,
    /// Writing the reply
    Acking,
    /// Loop exited
    Closed,
}

/// Application outcome of one documents batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every partition committed its slice
    Applied(AppliedSlice),
    /// Some attachment payload was neither sent nor stored; resend with streams
    MissingAttachments {
        /// Which payload was missing
        reason: String,
    },
}

/// Per-connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingStats {
    /// Message headers read
    pub messages_received: u64,
    /// Documents batches applied
    pub batches_applied: u64,
    /// Replication items read
    pub items_received: u64,
    /// Items written to storage
    pub items_applied: u64,
    /// Heartbeats and polls answered
    pub heartbeats: u64,
    /// Batches rejected for missing attachments
    pub missing_attachment_nacks: u64,
    /// Connection-fatal errors
    pub errors: u64,
}

/// Handler for one incoming replication connection
pub struct IncomingReplicationHandler<S> {
    source: String,
    config: Arc<ReplicationConfig>,
    reader: WireReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    queue: ReplicationQueue,
    workers: Arc<PartitionWorkers>,
    cancel: CancellationToken,
    state: HandlerState,
    last_document_etag: i64,
    activity: Option<Arc<ConnectionActivity>>,
    stats: IncomingStats,
}

impl<S> IncomingReplicationHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a connection; `source` identifies the sender in logs and replication state
    pub fn new(
        stream: S,
        source: impl Into<String>,
        config: Arc<ReplicationConfig>,
        workers: Arc<PartitionWorkers>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (read_half, writer) = tokio::io::split(stream);
        let reader = WireReader::new(read_half, &config)?;
        let queue = ReplicationQueue::new(ShardRouter::new(workers.partition_count())?);

        Ok(Self {
            source: source.into(),
            config,
            reader,
            writer,
            queue,
            workers,
            cancel,
            state: HandlerState::Connected,
            last_document_etag: 0,
            activity: None,
            stats: IncomingStats::default(),
        })
    }

    /// Report every received message to `activity`
    pub fn with_activity(mut self, activity: Arc<ConnectionActivity>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Current state
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Last etag acknowledged to the sender
    pub fn last_document_etag(&self) -> i64 {
        self.last_document_etag
    }

    /// Get statistics
    pub fn stats(&self) -> &IncomingStats {
        &self.stats
    }

    /// Run the read loop until cancellation or a connection-fatal error
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Incoming replication connection from {}", self.source);
        let idle_timeout = self.config.idle_timeout;

        loop {
            self.state = HandlerState::ReadingMessage;
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.state = HandlerState::Closed;
                    return Ok(());
                }
                read = tokio::time::timeout(idle_timeout, self.reader.read_message()) => read,
            };

            let message = match read {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return self.fail(e, UNKNOWN_MESSAGE_TYPE).await,
                Err(_) => {
                    let e = Error::network(format!("No message received for {:?}", idle_timeout));
                    return self.fail(e, UNKNOWN_MESSAGE_TYPE).await;
                }
            };

            self.stats.messages_received += 1;
            if let Some(activity) = &self.activity {
                activity.touch();
            }
            let message_type = message.message_type();
            let reply = match self.handle_message(message).await {
                Ok(reply) => reply,
                Err(e) => return self.fail(e, message_type).await,
            };

            self.state = HandlerState::Acking;
            if let Err(e) = reply.write_to(&mut self.writer).await {
                return self.fail(e, message_type).await;
            }
        }
    }

    async fn handle_message(&mut self, message: IncomingMessage) -> Result<ReplicationReply> {
        let message_type = message.message_type();
        match message {
            IncomingMessage::Poll => {
                self.state = HandlerState::Heartbeat;
                self.stats.heartbeats += 1;
                Ok(self.ok_reply(message_type))
            }
            IncomingMessage::Heartbeat { last_document_etag } => {
                self.state = HandlerState::Heartbeat;
                self.stats.heartbeats += 1;
                self.last_document_etag = last_document_etag;
                Ok(self.ok_reply(message_type))
            }
            IncomingMessage::Documents(header) => {
                self.state = HandlerState::DocumentsBatch;
                match self.handle_documents(header).await? {
                    BatchOutcome::Applied(applied) => {
                        self.last_document_etag = header.last_document_etag;
                        self.stats.batches_applied += 1;
                        self.stats.items_applied += applied.applied as u64;
                        Ok(self.ok_reply(message_type))
                    }
                    BatchOutcome::MissingAttachments { reason } => {
                        self.stats.missing_attachment_nacks += 1;
                        Ok(ReplicationReply::missing_attachments(message_type, reason))
                    }
                }
            }
        }
    }

    fn ok_reply(&self, message_type: &str) -> ReplicationReply {
        ReplicationReply::ok(message_type, self.last_document_etag, &self.config.node_tag)
    }

    /// Read, route and apply one batch; the queue is back to `Empty` on every exit
    async fn handle_documents(&mut self, header: BatchHeader) -> Result<BatchOutcome> {
        header.check_limits(
            self.config.max_items_per_batch,
            self.config.max_attachment_streams_per_batch,
        )?;

        self.queue.begin_batch()?;
        let result = self.apply_batch(header).await;
        if result.is_err() {
            self.queue.abort();
        }
        result
    }

    async fn apply_batch(&mut self, header: BatchHeader) -> Result<BatchOutcome> {
        let batch = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Shutdown),
            batch = self.reader.read_batch(&header) => batch?,
        };
        self.stats.items_received += batch.items.len() as u64;

        for item in batch.items {
            self.queue.push(item)?;
        }

        for stream in &batch.streams {
            let data = self.reader.load_stream(stream).await?;
            if self.queue.push_stream(&stream.hash, &data)? == 0 {
                tracing::debug!(
                    "Attachment stream {} from {} is not referenced by this batch",
                    stream.hash,
                    self.source
                );
            }
        }

        let sealed = self.queue.seal()?;
        let barrier = self
            .workers
            .dispatch(&self.source, header.last_document_etag, sealed)
            .await?;
        let outcomes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Shutdown),
            outcomes = barrier.wait() => outcomes,
        };
        self.queue.finish()?;

        let mut total = AppliedSlice::default();
        let mut missing = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(applied) => {
                    total.applied += applied.applied;
                    total.skipped += applied.skipped;
                }
                Err(e @ Error::MissingAttachment { .. }) => {
                    missing.get_or_insert((outcome.partition, e));
                }
                Err(e) => return Err(e),
            }
        }

        if let Some((partition, error)) = missing {
            tracing::info!(
                "Batch from {} failed on partition {}: {}, requesting a resend with attachments",
                self.source,
                partition,
                error
            );
            return Ok(BatchOutcome::MissingAttachments {
                reason: error.to_string(),
            });
        }

        tracing::debug!(
            "Applied batch from {} up to etag {}: {} items written, {} already merged",
            self.source,
            header.last_document_etag,
            total.applied,
            total.skipped
        );
        Ok(BatchOutcome::Applied(total))
    }

    /// Terminal error path; always closes the loop
    async fn fail(&mut self, error: Error, message_type: &str) -> Result<()> {
        self.state = HandlerState::Closed;

        if self.cancel.is_cancelled() || matches!(error, Error::Shutdown) {
            return Ok(());
        }

        self.stats.errors += 1;

        if error.is_network_fault() {
            tracing::info!(
                "Failed to read data from incoming connection {}: {}",
                self.source,
                error
            );
            return Err(error);
        }

        tracing::info!(
            "Failed to process replication message from {}: {}",
            self.source,
            error
        );
        let reply = ReplicationReply::error(message_type, error.to_string());
        if let Err(e) = reply.write_to(&mut self.writer).await {
            tracing::debug!("Failed to send error reply to {}: {}", self.source, e);
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::partition::PartitionApplier;
    use crate::replication::protocol::{Frame, OutgoingHeader, ReplyType};
    use crate::replication::queue::PartitionSlice;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    struct CountingApplier;

    #[async_trait]
    impl PartitionApplier for CountingApplier {
        async fn apply(
            &self,
            _source: &str,
            _last_document_etag: i64,
            slice: PartitionSlice,
        ) -> Result<AppliedSlice> {
            Ok(AppliedSlice {
                applied: slice.items.len(),
                skipped: 0,
            })
        }
    }

    fn start() -> (DuplexStream, CancellationToken, tokio::task::JoinHandle<(Result<()>, IncomingStats)>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let workers = Arc::new(PartitionWorkers::spawn(Arc::new(CountingApplier), 2, 2));
        let cancel = CancellationToken::new();
        let mut handler = IncomingReplicationHandler::new(
            server,
            "test-peer",
            Arc::new(ReplicationConfig::default()),
            workers,
            cancel.clone(),
        )
        .unwrap();
        assert_eq!(handler.state(), HandlerState::Connected);

        let task = tokio::spawn(async move {
            let result = handler.run().await;
            assert_eq!(handler.state(), HandlerState::Closed);
            (result, handler.stats().clone())
        });
        (client, cancel, task)
    }

    #[tokio::test]
    async fn test_poll_and_heartbeat() {
        let (mut client, cancel, task) = start();

        Frame::json(&OutgoingHeader::heartbeat(12))
            .unwrap()
            .write_to(&mut client)
            .await
            .unwrap();
        let reply = ReplicationReply::read_from(&mut client, 1 << 20).await.unwrap();
        assert_eq!(reply.r#type, ReplyType::Ok);
        assert_eq!(reply.message_type, "Heartbeat");
        assert_eq!(reply.last_etag_accepted, 12);

        Frame::new(crate::replication::protocol::FrameKind::Message, bytes::Bytes::new())
            .write_to(&mut client)
            .await
            .unwrap();
        let reply = ReplicationReply::read_from(&mut client, 1 << 20).await.unwrap();
        assert_eq!(reply.message_type, "Notify");
        assert_eq!(reply.last_etag_accepted, 12);
        assert_eq!(reply.node_tag.as_deref(), Some("A"));

        cancel.cancel();
        let (result, stats) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.heartbeats, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_acknowledged() {
        let (mut client, cancel, task) = start();

        Frame::json(&OutgoingHeader::documents(77, 0, 0))
            .unwrap()
            .write_to(&mut client)
            .await
            .unwrap();
        let reply = ReplicationReply::read_from(&mut client, 1 << 20).await.unwrap();
        assert_eq!(reply.r#type, ReplyType::Ok);
        assert_eq!(reply.last_etag_accepted, 77);

        cancel.cancel();
        let (_, stats) = task.await.unwrap();
        assert_eq!(stats.batches_applied, 1);
        assert_eq!(stats.items_received, 0);
    }

    #[tokio::test]
    async fn test_missing_field_closes_with_error_reply() {
        let (mut client, _cancel, task) = start();

        Frame::new(
            crate::replication::protocol::FrameKind::Message,
            bytes::Bytes::from_static(br#"{"Type":"Documents","LastDocumentEtag":3}"#),
        )
        .write_to(&mut client)
        .await
        .unwrap();

        let reply = ReplicationReply::read_from(&mut client, 1 << 20).await.unwrap();
        assert_eq!(reply.r#type, ReplyType::Error);
        assert_eq!(reply.last_etag_accepted, -1);
        assert!(reply.exception.unwrap().contains("ItemsCount"));

        let (result, stats) = task.await.unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_batch_cut_mid_frame_gets_error_reply() {
        let (mut client, _cancel, task) = start();

        Frame::json(&OutgoingHeader::documents(5, 1, 0))
            .unwrap()
            .write_to(&mut client)
            .await
            .unwrap();
        let item = Frame::new(
            crate::replication::protocol::FrameKind::Item,
            bytes::Bytes::from_static(b"partial item payload"),
        )
        .encode();
        tokio::io::AsyncWriteExt::write_all(&mut client, &item[..10]).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut client).await.unwrap();

        let reply = ReplicationReply::read_from(&mut client, 1 << 20).await.unwrap();
        assert_eq!(reply.r#type, ReplyType::Error);
        assert_eq!(reply.message_type, "Documents");
        assert!(reply.exception.unwrap().contains("Truncated"));

        let (result, stats) = task.await.unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(stats.batches_applied, 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_network_fault() {
        let (client, _cancel, task) = start();
        drop(client);

        let (result, _) = task.await.unwrap();
        assert!(result.unwrap_err().is_network_fault());
    }

    #[tokio::test]
    async fn test_cancel_while_idle_sends_nothing() {
        let (mut client, cancel, task) = start();
        cancel.cancel();
        let (result, stats) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.messages_received, 0);

        // The handler is gone and wrote nothing
        let mut buf = [0u8; 1];
        let read = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
