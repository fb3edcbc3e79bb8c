//! Applier wrapper that slows partitions down and records what happened

use crate::replication::partition::PartitionApplier;
use crate::replication::queue::PartitionSlice;
use crate::transaction::AppliedSlice;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One entry of the applier event log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEvent {
    /// A partition started applying the batch with this etag
    Started {
        /// Partition index
        partition: usize,
        /// `LastDocumentEtag` of the batch
        etag: i64,
    },
    /// A partition finished applying the batch with this etag
    Finished {
        /// Partition index
        partition: usize,
        /// `LastDocumentEtag` of the batch
        etag: i64,
    },
}

/// Delays selected partitions before delegating to an inner applier
pub struct DelayedApplier {
    inner: Arc<dyn PartitionApplier>,
    delays: HashMap<usize, Duration>,
    failing: Option<usize>,
    events: Mutex<Vec<ApplyEvent>>,
}

impl DelayedApplier {
    /// Wrap `inner` with no delays
    pub fn new(inner: Arc<dyn PartitionApplier>) -> Self {
        Self {
            inner,
            delays: HashMap::new(),
            failing: None,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Sleep `delay` before applying any slice of `partition`
    pub fn with_delay(mut self, partition: usize, delay: Duration) -> Self {
        self.delays.insert(partition, delay);
        self
    }

    /// Fail every slice of `partition` with a storage error
    pub fn with_failure(mut self, partition: usize) -> Self {
        self.failing = Some(partition);
        self
    }

    /// Event log so far
    pub fn events(&self) -> Vec<ApplyEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl PartitionApplier for DelayedApplier {
    async fn apply(
        &self,
        source: &str,
        last_document_etag: i64,
        slice: PartitionSlice,
    ) -> Result<AppliedSlice> {
        let partition = slice.partition;
        self.events.lock().push(ApplyEvent::Started {
            partition,
            etag: last_document_etag,
        });

        if let Some(delay) = self.delays.get(&partition) {
            tokio::time::sleep(*delay).await;
        }

        let result = if self.failing == Some(partition) {
            Err(Error::storage(format!("partition {} is failing", partition)))
        } else {
            self.inner.apply(source, last_document_etag, slice).await
        };

        self.events.lock().push(ApplyEvent::Finished {
            partition,
            etag: last_document_etag,
        });
        result
    }
}
