//! Partition consumers
//!
//! One tokio task per partition drains slices from a bounded channel and hands
//! them to a [`PartitionApplier`]. Slices of one partition are applied strictly
//! one after another; different partitions run concurrently.

use crate::replication::barrier::{CompletionBarrier, CompletionToken};
use crate::replication::config::MergerConfig;
use crate::replication::queue::{PartitionSlice, SealedBatch};
use crate::storage::Storage;
use crate::transaction::{
    AppliedSlice, ApplyReplicationBatchCommand, MergerStats, TransactionMerger,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Applies one partition's slice of a batch
#[async_trait]
pub trait PartitionApplier: Send + Sync + 'static {
    /// Apply `slice`; `source` identifies the sending connection
    async fn apply(
        &self,
        source: &str,
        last_document_etag: i64,
        slice: PartitionSlice,
    ) -> Result<AppliedSlice>;
}

/// Production applier: one transaction merger per partition
pub struct MergerApplier {
    mergers: Vec<TransactionMerger>,
}

impl MergerApplier {
    /// Start one merger per storage partition
    pub fn start(partitions: Vec<Arc<dyn Storage>>, config: &MergerConfig) -> Result<Self> {
        let mergers = partitions
            .into_iter()
            .enumerate()
            .map(|(partition, storage)| TransactionMerger::start(partition, storage, config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { mergers })
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.mergers.len()
    }

    /// Per-partition merger statistics
    pub fn stats(&self) -> Vec<MergerStats> {
        self.mergers.iter().map(TransactionMerger::stats).collect()
    }
}

#[async_trait]
impl PartitionApplier for MergerApplier {
    async fn apply(
        &self,
        source: &str,
        last_document_etag: i64,
        slice: PartitionSlice,
    ) -> Result<AppliedSlice> {
        let merger = self.mergers.get(slice.partition).ok_or_else(|| {
            Error::internal(format!("No transaction merger for partition {}", slice.partition))
        })?;
        let command = ApplyReplicationBatchCommand::new(source, last_document_etag, slice.items);
        merger.enqueue(command).await
    }
}

struct SliceJob {
    source: Arc<str>,
    last_document_etag: i64,
    slice: PartitionSlice,
    token: CompletionToken,
}

/// Long-lived partition consumer tasks shared by every connection
pub struct PartitionWorkers {
    senders: Vec<mpsc::Sender<SliceJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl PartitionWorkers {
    /// Spawn one consumer per partition on the current runtime
    pub fn spawn(applier: Arc<dyn PartitionApplier>, partitions: usize, queue_capacity: usize) -> Self {
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            let applier = applier.clone();
            handles.push(tokio::spawn(Self::consume(partition, applier, rx)));
            senders.push(tx);
        }

        Self { senders, handles }
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.senders.len()
    }

    /// Hand every slice of `batch` to its consumer and return the armed barrier
    ///
    /// Empty slices are completed immediately without waking their consumer.
    pub async fn dispatch(
        &self,
        source: &str,
        last_document_etag: i64,
        batch: SealedBatch,
    ) -> Result<CompletionBarrier> {
        if batch.slices.len() != self.senders.len() {
            return Err(Error::internal(format!(
                "Batch has {} slices but {} partition workers run",
                batch.slices.len(),
                self.senders.len()
            )));
        }

        let source: Arc<str> = Arc::from(source);
        for (slice, token) in batch.slices {
            if slice.is_empty() {
                token.complete(Ok(AppliedSlice::default()));
                continue;
            }

            let job = SliceJob {
                source: source.clone(),
                last_document_etag,
                slice,
                token,
            };
            let partition = job.slice.partition;
            if self.senders[partition].send(job).await.is_err() {
                // The returned job is dropped here, which reports the failure to the barrier
                tracing::error!("Partition {} worker is gone", partition);
            }
        }

        Ok(batch.barrier)
    }

    async fn consume(
        partition: usize,
        applier: Arc<dyn PartitionApplier>,
        mut rx: mpsc::Receiver<SliceJob>,
    ) {
        while let Some(job) = rx.recv().await {
            let count = job.slice.items.len();
            let result = applier
                .apply(&job.source, job.last_document_etag, job.slice)
                .await;
            match &result {
                Ok(applied) => tracing::debug!(
                    "Partition {} applied {} of {} items ({} already merged)",
                    partition,
                    applied.applied,
                    count,
                    applied.skipped
                ),
                Err(e) => tracing::debug!("Partition {} failed to apply slice: {}", partition, e),
            }
            job.token.complete(result);
        }
    }

    /// Close the queues and wait for in-flight slices to finish
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::items::{ItemHeader, ReplicationItem};
    use crate::replication::queue::ReplicationQueue;
    use crate::replication::router::ShardRouter;
    use crate::storage::{MemoryStorage, Table};
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        seen: Mutex<Vec<(usize, String, usize)>>,
    }

    #[async_trait]
    impl PartitionApplier for RecordingApplier {
        async fn apply(
            &self,
            source: &str,
            _last_document_etag: i64,
            slice: PartitionSlice,
        ) -> Result<AppliedSlice> {
            self.seen
                .lock()
                .push((slice.partition, source.to_string(), slice.items.len()));
            Ok(AppliedSlice {
                applied: slice.items.len(),
                skipped: 0,
            })
        }
    }

    fn document(id: &str) -> ReplicationItem {
        ReplicationItem::Document {
            header: ItemHeader::new("A:1-dbA", 1, DateTime::<Utc>::from_timestamp_millis(0).unwrap()),
            id: id.into(),
            collection: "Users".into(),
            data: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn test_empty_slices_complete_without_consumer() {
        let applier = Arc::new(RecordingApplier::default());
        let workers = PartitionWorkers::spawn(applier.clone(), 4, 2);

        let mut queue = ReplicationQueue::new(ShardRouter::new(4).unwrap());
        queue.begin_batch().unwrap();
        let partition = queue.push(document("users/1")).unwrap();
        let sealed = queue.seal().unwrap();

        let barrier = workers.dispatch("peer", 1, sealed).await.unwrap();
        let outcomes = barrier.wait().await;
        assert_eq!(outcomes.len(), 4);
        for outcome in &outcomes {
            let applied = outcome.result.as_ref().unwrap().applied;
            assert_eq!(applied, usize::from(outcome.partition == partition));
        }

        let seen = applier.seen.lock().clone();
        assert_eq!(seen, vec![(partition, "peer".to_string(), 1)]);
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn test_slice_count_mismatch() {
        let workers = PartitionWorkers::spawn(Arc::new(RecordingApplier::default()), 2, 1);
        let mut queue = ReplicationQueue::new(ShardRouter::new(3).unwrap());
        queue.begin_batch().unwrap();
        let sealed = queue.seal().unwrap();
        assert!(workers.dispatch("peer", 1, sealed).await.is_err());
    }

    #[tokio::test]
    async fn test_merger_applier_commits_per_partition() {
        let storages: Vec<Arc<MemoryStorage>> = (0..2).map(|_| Arc::new(MemoryStorage::new())).collect();
        let applier = MergerApplier::start(
            storages.iter().map(|s| s.clone() as Arc<dyn Storage>).collect(),
            &MergerConfig::default(),
        )
        .unwrap();
        assert_eq!(applier.partition_count(), 2);

        let slice = PartitionSlice {
            partition: 1,
            items: vec![document("users/9")],
        };
        let applied = applier.apply("peer", 9, slice).await.unwrap();
        assert_eq!(applied.applied, 1);

        assert!(storages[0].is_empty(Table::Documents));
        assert_eq!(storages[1].len(Table::Documents), 1);
        assert_eq!(applier.stats()[1].transactions_committed, 1);
    }
}
