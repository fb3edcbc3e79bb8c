//! In-process replication connection for tests

use crate::replication::config::ReplicationConfig;
use crate::replication::handler::{IncomingReplicationHandler, IncomingStats};
use crate::replication::partition::{MergerApplier, PartitionApplier, PartitionWorkers};
use crate::replication::protocol::ReplicationReply;
use crate::replication::router::ShardRouter;
use crate::storage::records::{self, DocumentRecord};
use crate::storage::{MemoryStorage, ReplicationState, Storage, Table};
use crate::testing::wire::BatchBuilder;
use crate::Result;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Source name the harness connection reports
pub const HARNESS_SOURCE: &str = "harness-peer";

const DUPLEX_BUFFER: usize = 1024 * 1024;

/// A running handler whose sender side is driven by the test
pub struct ReplicationHarness {
    client: DuplexStream,
    storages: Vec<Arc<MemoryStorage>>,
    router: ShardRouter,
    cancel: CancellationToken,
    task: JoinHandle<(Result<()>, IncomingStats)>,
    max_frame_size: usize,
}

impl ReplicationHarness {
    /// Handler over `partitions` in-memory partitions with default limits
    pub fn start(partitions: usize) -> Self {
        Self::start_with(ReplicationConfig::default().with_partitions(partitions))
    }

    /// Handler over in-memory partitions, one per `config.partition_count`
    pub fn start_with(config: ReplicationConfig) -> Self {
        let storages = Self::memory_partitions(config.partition_count);
        let applier = Self::merger_applier(&storages, &config);
        Self::start_with_applier(config, storages, applier)
    }

    /// Handler driving `applier`; `storages` are only used for inspection
    pub fn start_with_applier(
        config: ReplicationConfig,
        storages: Vec<Arc<MemoryStorage>>,
        applier: Arc<dyn PartitionApplier>,
    ) -> Self {
        let router = ShardRouter::new(config.partition_count).expect("valid partition count");
        let workers = Arc::new(PartitionWorkers::spawn(
            applier,
            config.partition_count,
            config.partition_queue_capacity,
        ));

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let cancel = CancellationToken::new();
        let max_frame_size = config.max_frame_size;
        let mut handler = IncomingReplicationHandler::new(
            server,
            HARNESS_SOURCE,
            Arc::new(config),
            workers,
            cancel.clone(),
        )
        .expect("handler starts");

        let task = tokio::spawn(async move {
            let result = handler.run().await;
            (result, handler.stats().clone())
        });

        Self {
            client,
            storages,
            router,
            cancel,
            task,
            max_frame_size,
        }
    }

    /// Fresh in-memory partitions
    pub fn memory_partitions(count: usize) -> Vec<Arc<MemoryStorage>> {
        (0..count).map(|_| Arc::new(MemoryStorage::new())).collect()
    }

    /// Transaction mergers over `storages`
    pub fn merger_applier(
        storages: &[Arc<MemoryStorage>],
        config: &ReplicationConfig,
    ) -> Arc<MergerApplier> {
        let partitions = storages
            .iter()
            .map(|storage| storage.clone() as Arc<dyn Storage>)
            .collect();
        Arc::new(MergerApplier::start(partitions, &config.merger).expect("mergers start"))
    }

    /// Write a documents message
    pub async fn send(&mut self, batch: &BatchBuilder) {
        batch.write_to(&mut self.client).await.expect("send batch");
    }

    /// Write raw bytes
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.client.write_all(bytes).await.expect("send bytes");
        self.client.flush().await.expect("flush");
    }

    /// Read the next reply
    pub async fn reply(&mut self) -> ReplicationReply {
        ReplicationReply::read_from(&mut self.client, self.max_frame_size)
            .await
            .expect("read reply")
    }

    /// Send a batch and wait for its reply
    pub async fn exchange(&mut self, batch: &BatchBuilder) -> ReplicationReply {
        self.send(batch).await;
        self.reply().await
    }

    /// Sender side of the connection
    pub fn client_mut(&mut self) -> &mut DuplexStream {
        &mut self.client
    }

    /// Partition a document id routes to
    pub fn partition_of(&self, document_id: &str) -> usize {
        self.router.partition_for_key(document_id)
    }

    /// Storage of one partition
    pub fn storage(&self, partition: usize) -> &Arc<MemoryStorage> {
        &self.storages[partition]
    }

    /// Committed document, read from the partition it routes to
    pub fn document(&self, id: &str) -> Option<DocumentRecord> {
        self.storage(self.partition_of(id))
            .read(Table::Documents, &id.to_lowercase())
            .expect("read document")
            .map(|raw| records::decode(&raw).expect("decode document"))
    }

    /// Committed replication state of one partition
    pub fn state(&self, partition: usize) -> Option<ReplicationState> {
        self.storage(partition).read_last_state().expect("read state")
    }

    /// Cancel the handler and collect its result
    pub async fn stop(self) -> (Result<()>, IncomingStats) {
        self.cancel.cancel();
        self.task.await.expect("handler task")
    }

    /// Wait for the handler to exit on its own
    pub async fn closed(self) -> (Result<()>, IncomingStats) {
        self.task.await.expect("handler task")
    }
}
