//! Transaction layer - merged single-writer commits
//!
//! - [`TransactionMerger`]: one writer thread per partition folding queued
//!   commands into shared write transactions
//! - [`MergedTransactionCommand`]: unit of work with a replayable DTO
//! - [`OperationContext`]: pooled transaction-scoped state, reset on checkout

pub mod commands;
pub mod context;
pub mod merger;

pub use commands::{
    AppliedSlice, ApplyReplicationBatchCommand, ApplyReplicationBatchCommandDto,
    MergedTransactionCommand, ReplayableCommandDto,
};
pub use context::{ContextPool, OperationContext, PooledContext};
pub use merger::{MergerStats, TransactionMerger};
