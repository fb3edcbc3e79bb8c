//! Transaction merger
//!
//! One merger owns the single write transaction of one partition. Commands
//! are submitted from async code through a bounded channel and executed on a
//! dedicated writer thread:
//!
//! - Up to `max_batch_size` queued commands share one write transaction and
//!   one commit
//! - If any of them fails, the shared transaction is aborted and every command
//!   of the cycle is rebuilt from its DTO and run alone in a fresh transaction,
//!   so each submitter receives its own result
//!
//! Results travel back through a oneshot per command.

use crate::replication::config::MergerConfig;
use crate::storage::{Storage, WriteTransaction};
use crate::transaction::commands::{MergedTransactionCommand, ReplayableCommandDto};
use crate::transaction::context::{ContextPool, OperationContext};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Merger statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergerStats {
    /// Commands executed successfully
    pub commands_executed: u64,
    /// Commands that returned an error to their submitter
    pub commands_failed: u64,
    /// Write transactions committed
    pub transactions_committed: u64,
    /// Merged transactions that were aborted and replayed one by one
    pub merged_retries: u64,
    /// Largest number of commands sharing one transaction
    pub max_commands_per_transaction: u64,
    /// Total time spent inside write transactions (in microseconds)
    pub total_transaction_time_us: u64,
}

/// A queued command with its result slot
trait QueuedCommand: Send {
    fn execute(&mut self, ctx: &mut OperationContext, txn: &mut dyn WriteTransaction) -> Result<()>;

    /// Rebuild the command from its DTO, dropping any partial output
    fn rebuild(&mut self) -> Result<()>;

    fn complete(self: Box<Self>, result: Result<()>);
}

struct Pending<C: MergedTransactionCommand> {
    command: C,
    output: Option<C::Output>,
    reply: oneshot::Sender<Result<C::Output>>,
}

impl<C: MergedTransactionCommand> QueuedCommand for Pending<C> {
    fn execute(&mut self, ctx: &mut OperationContext, txn: &mut dyn WriteTransaction) -> Result<()> {
        self.output = Some(self.command.execute(ctx, txn)?);
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        self.command = self.command.to_dto().into_command()?;
        self.output = None;
        Ok(())
    }

    fn complete(self: Box<Self>, result: Result<()>) {
        let this = *self;
        let result = result.and_then(|()| {
            this.output
                .ok_or_else(|| Error::internal("Command completed without producing output"))
        });
        // The submitter may have stopped waiting
        let _ = this.reply.send(result);
    }
}

type Queued = Box<dyn QueuedCommand>;

/// Single-writer command scheduler for one partition
pub struct TransactionMerger {
    partition: usize,
    sender: Option<mpsc::Sender<Queued>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<MergerStats>>,
}

impl TransactionMerger {
    /// Start a merger over `storage`
    pub fn start(partition: usize, storage: Arc<dyn Storage>, config: MergerConfig) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(Mutex::new(MergerStats::default()));

        let writer = MergerThread {
            partition,
            storage,
            receiver,
            contexts: ContextPool::new(),
            stats: stats.clone(),
            max_batch_size: config.max_batch_size.max(1),
            write_timeout: config.write_timeout,
            ignored_db_ids: config.ignored_db_ids,
        };

        let handle = thread::Builder::new()
            .name(format!("docrepl-merger-{}", partition))
            .spawn(move || writer.run())?;

        tracing::debug!("Transaction merger for partition {} started", partition);

        Ok(Self {
            partition,
            sender: Some(sender),
            handle: Some(handle),
            stats,
        })
    }

    /// Partition this merger writes to
    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Queue a command and wait for its result
    ///
    /// Waits for queue capacity when the merger is saturated.
    pub async fn enqueue<C: MergedTransactionCommand>(&self, command: C) -> Result<C::Output> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::transaction("Transaction merger is stopped"))?;

        let (reply, result) = oneshot::channel();
        let pending: Queued = Box::new(Pending {
            command,
            output: None,
            reply,
        });

        sender
            .send(pending)
            .await
            .map_err(|_| Error::transaction("Transaction merger is stopped"))?;

        result
            .await
            .map_err(|_| Error::transaction("Transaction merger dropped the command"))?
    }

    /// Get statistics
    pub fn stats(&self) -> MergerStats {
        self.stats.lock().clone()
    }

    /// Stop accepting commands and wait for the writer thread to drain the queue
    pub fn shutdown(&mut self) -> Result<()> {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::transaction("Merger thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for TransactionMerger {
    fn drop(&mut self) {
        // Closing the channel lets the writer thread exit on its own
        self.sender.take();
    }
}

struct MergerThread {
    partition: usize,
    storage: Arc<dyn Storage>,
    receiver: mpsc::Receiver<Queued>,
    contexts: ContextPool,
    stats: Arc<Mutex<MergerStats>>,
    max_batch_size: usize,
    write_timeout: Duration,
    ignored_db_ids: HashSet<String>,
}

impl MergerThread {
    fn run(mut self) {
        let mut batch: Vec<Queued> = Vec::with_capacity(self.max_batch_size);

        while let Some(first) = self.receiver.blocking_recv() {
            batch.push(first);
            while batch.len() < self.max_batch_size {
                match self.receiver.try_recv() {
                    Ok(command) => batch.push(command),
                    Err(_) => break,
                }
            }
            self.process(&mut batch);
        }

        tracing::debug!(
            "Transaction merger for partition {} stopped",
            self.partition
        );
    }

    fn process(&self, batch: &mut Vec<Queued>) {
        let count = batch.len();
        match self.run_transaction(batch.as_mut_slice()) {
            Ok(()) => {
                {
                    let mut stats = self.stats.lock();
                    stats.commands_executed += count as u64;
                    stats.max_commands_per_transaction =
                        stats.max_commands_per_transaction.max(count as u64);
                }
                for command in batch.drain(..) {
                    command.complete(Ok(()));
                }
            }
            Err(e) if count == 1 => {
                self.stats.lock().commands_failed += 1;
                if let Some(command) = batch.pop() {
                    command.complete(Err(e));
                }
            }
            Err(e) => {
                tracing::debug!(
                    "Merged transaction of {} commands on partition {} failed ({}), replaying one by one",
                    count,
                    self.partition,
                    e
                );
                self.stats.lock().merged_retries += 1;

                for mut command in batch.drain(..) {
                    let result = command
                        .rebuild()
                        .and_then(|()| self.run_transaction(std::slice::from_mut(&mut command)));
                    {
                        let mut stats = self.stats.lock();
                        if result.is_ok() {
                            stats.commands_executed += 1;
                        } else {
                            stats.commands_failed += 1;
                        }
                    }
                    command.complete(result);
                }
            }
        }
    }

    /// Run `commands` in one write transaction; nothing is committed unless all succeed
    fn run_transaction(&self, commands: &mut [Queued]) -> Result<()> {
        let started = Instant::now();
        let mut txn = self.storage.write_txn(Some(self.write_timeout))?;
        let mut ctx = self.contexts.allocate();
        ctx.ignore_db_ids(self.ignored_db_ids.iter().cloned());

        for command in commands.iter_mut() {
            command.execute(&mut ctx, txn.as_mut())?;
        }
        txn.commit()?;

        let mut stats = self.stats.lock();
        stats.transactions_committed += 1;
        stats.total_transaction_time_us += started.elapsed().as_micros() as u64;
        Ok(())
    }
}
