//! Fan-out completion barrier
//!
//! A batch is split into one slice per partition. [`CompletionBarrier::new`]
//! hands out exactly one [`CompletionToken`] per partition and the barrier only
//! resolves once every token has reported, so the connection cannot move on to
//! the next batch while any partition is still working on the current one.

use crate::transaction::commands::AppliedSlice;
use crate::{Error, Result};
use tokio::sync::mpsc;

/// Result reported by one partition
#[derive(Debug)]
pub struct PartitionOutcome {
    /// Reporting partition
    pub partition: usize,
    /// What applying the slice produced
    pub result: Result<AppliedSlice>,
}

/// Single-use completion signal for one partition
///
/// Dropping a token without calling [`CompletionToken::complete`] reports an
/// internal error for its partition, so a panicking or cancelled consumer can
/// never leave the barrier waiting forever.
#[derive(Debug)]
pub struct CompletionToken {
    partition: usize,
    tx: Option<mpsc::Sender<PartitionOutcome>>,
}

impl CompletionToken {
    /// Partition this token belongs to
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Report the partition's result
    pub fn complete(mut self, result: Result<AppliedSlice>) {
        self.send(result);
    }

    fn send(&mut self, result: Result<AppliedSlice>) {
        if let Some(tx) = self.tx.take() {
            // Capacity equals the number of tokens, so this never fails while the barrier lives
            let _ = tx.try_send(PartitionOutcome {
                partition: self.partition,
                result,
            });
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let partition = self.partition;
            self.send(Err(Error::internal(format!(
                "Partition {} consumer dropped its slice without reporting",
                partition
            ))));
        }
    }
}

/// Countdown over N partition completions
#[derive(Debug)]
pub struct CompletionBarrier {
    rx: mpsc::Receiver<PartitionOutcome>,
    expected: usize,
}

impl CompletionBarrier {
    /// Arm a barrier for `partitions` partitions, returning one token per partition
    pub fn new(partitions: usize) -> (Self, Vec<CompletionToken>) {
        let (tx, rx) = mpsc::channel(partitions.max(1));
        let tokens = (0..partitions)
            .map(|partition| CompletionToken {
                partition,
                tx: Some(tx.clone()),
            })
            .collect();
        (
            Self {
                rx,
                expected: partitions,
            },
            tokens,
        )
    }

    /// Number of partitions this barrier waits for
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Wait until every partition reported; outcomes are ordered by partition
    pub async fn wait(mut self) -> Vec<PartitionOutcome> {
        let mut outcomes = Vec::with_capacity(self.expected);
        while outcomes.len() < self.expected {
            match self.rx.recv().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes.sort_by_key(|outcome| outcome.partition);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waits_for_every_partition() {
        let (barrier, tokens) = CompletionBarrier::new(3);
        assert_eq!(barrier.expected(), 3);

        for token in tokens {
            tokio::spawn(async move {
                let delay = 10 * (3 - token.partition() as u64);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let applied = token.partition();
                token.complete(Ok(AppliedSlice {
                    applied,
                    skipped: 0,
                }));
            });
        }

        let outcomes = barrier.wait().await;
        assert_eq!(outcomes.len(), 3);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.partition, i);
            assert_eq!(outcome.result.as_ref().unwrap().applied, i);
        }
    }

    #[tokio::test]
    async fn test_pending_until_last_token() {
        let (barrier, mut tokens) = CompletionBarrier::new(2);
        let last = tokens.pop().unwrap();
        tokens.pop().unwrap().complete(Ok(AppliedSlice::default()));

        let wait = tokio::spawn(barrier.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!wait.is_finished());

        last.complete(Ok(AppliedSlice::default()));
        assert_eq!(wait.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_token_reports_error() {
        let (barrier, mut tokens) = CompletionBarrier::new(2);
        tokens.remove(0).complete(Ok(AppliedSlice::default()));
        drop(tokens);

        let outcomes = barrier.wait().await;
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_zero_partitions() {
        let (barrier, tokens) = CompletionBarrier::new(0);
        assert!(tokens.is_empty());
        assert!(barrier.wait().await.is_empty());
    }
}
