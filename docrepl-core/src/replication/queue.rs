//! Per-connection replication queue
//!
//! Holds one pending list per partition for the batch being read:
//!
//! ```text
//! Empty ──begin_batch──► Filling ──seal──► Draining ──finish──► Empty
//!   ▲                       │                  │
//!   └─────────abort─────────┴──────────────────┘
//! ```
//!
//! `seal` arms a [`CompletionBarrier`] with the partition count and hands the
//! slices out; `finish` is only legal after the barrier resolved.

use crate::replication::barrier::{CompletionBarrier, CompletionToken};
use crate::replication::dedup::AttachmentDeduplicator;
use crate::replication::items::ReplicationItem;
use crate::replication::router::ShardRouter;
use crate::{Error, Result};
use std::mem;

/// Queue lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No batch in progress
    Empty,
    /// Items of a batch are being read and routed
    Filling,
    /// Slices were handed to partition consumers
    Draining,
}

/// One partition's share of a batch
#[derive(Debug)]
pub struct PartitionSlice {
    /// Destination partition
    pub partition: usize,
    /// Items in wire order, attachment streams last
    pub items: Vec<ReplicationItem>,
}

impl PartitionSlice {
    /// Whether there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A sealed batch: one slice and one completion token per partition
#[derive(Debug)]
pub struct SealedBatch {
    /// Slices paired with their completion tokens, indexed by partition
    pub slices: Vec<(PartitionSlice, CompletionToken)>,
    /// Resolves once every token reported
    pub barrier: CompletionBarrier,
}

/// Per-partition pending lists for the batch in flight
#[derive(Debug)]
pub struct ReplicationQueue {
    state: QueueState,
    router: ShardRouter,
    pending: Vec<Vec<ReplicationItem>>,
    dedup: AttachmentDeduplicator,
}

impl ReplicationQueue {
    /// Create an empty queue
    pub fn new(router: ShardRouter) -> Self {
        let partitions = router.partition_count();
        Self {
            state: QueueState::Empty,
            router,
            pending: (0..partitions).map(|_| Vec::new()).collect(),
            dedup: AttachmentDeduplicator::new(partitions),
        }
    }

    /// Current state
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.pending.len()
    }

    /// Items pending for `partition`
    pub fn pending(&self, partition: usize) -> &[ReplicationItem] {
        self.pending
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Attachment deduplication state of the current batch
    pub fn dedup(&self) -> &AttachmentDeduplicator {
        &self.dedup
    }

    fn require(&self, expected: QueueState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::internal(format!(
                "Replication queue cannot {} in state {:?}",
                op, self.state
            )));
        }
        Ok(())
    }

    /// Start a batch
    pub fn begin_batch(&mut self) -> Result<()> {
        self.require(QueueState::Empty, "begin a batch")?;
        self.state = QueueState::Filling;
        Ok(())
    }

    /// Route an item into its partition, returning the partition index
    pub fn push(&mut self, item: ReplicationItem) -> Result<usize> {
        self.require(QueueState::Filling, "accept items")?;
        let partition = self.router.route(&item)?;
        self.dedup.observe(partition, &item);
        self.pending[partition].push(item);
        Ok(partition)
    }

    /// Give every partition referencing `hash` its own copy of the payload
    ///
    /// Returns the number of partitions that received a copy.
    pub fn push_stream(&mut self, hash: &str, data: &[u8]) -> Result<usize> {
        self.require(QueueState::Filling, "accept attachment streams")?;
        let copies = self.dedup.attach_stream(hash, data);
        let count = copies.len();
        for (partition, item) in copies {
            self.pending[partition].push(item);
        }
        Ok(count)
    }

    /// Stop filling and hand out the slices behind a freshly armed barrier
    pub fn seal(&mut self) -> Result<SealedBatch> {
        self.require(QueueState::Filling, "seal")?;
        let partitions = self.pending.len();
        let (barrier, tokens) = CompletionBarrier::new(partitions);

        let slices = self
            .pending
            .iter_mut()
            .enumerate()
            .map(|(partition, items)| PartitionSlice {
                partition,
                items: mem::take(items),
            })
            .zip(tokens)
            .collect();

        self.state = QueueState::Draining;
        Ok(SealedBatch { slices, barrier })
    }

    /// Return to `Empty` after the barrier resolved
    pub fn finish(&mut self) -> Result<()> {
        self.require(QueueState::Draining, "finish")?;
        self.reset();
        Ok(())
    }

    /// Drop the batch in progress from any state
    pub fn abort(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        for items in &mut self.pending {
            items.clear();
        }
        self.dedup.clear();
        self.state = QueueState::Empty;
    }
}
