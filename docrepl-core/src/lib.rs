//! docrepl Core - Incoming Replication and Transaction Commit
//!
//! This crate provides the receiving side of document replication:
//! - Framed wire protocol for replication batches and replies
//! - Change vectors with conflict classification and merging
//! - Sharded ingestion with per-partition queues and a completion barrier
//! - Merged single-writer transactions with per-command replay on failure
//! - Storage adapters (in-memory and LMDB via heed)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Replication Layer                  │
//! │  (Listener, Handler, Reader, Queue, Router) │
//! └──────────────┬──────────────────────────────┘
//!                │ one slice per partition
//! ┌──────────────┴──────────────────────────────┐
//! │          Transaction Layer                  │
//! │   (Merger, Commands, Operation Context)     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Storage Layer                    │
//! │      (Write Transactions, Records)          │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod change_vector;
pub mod error;
pub mod replication;
pub mod storage;
pub mod transaction;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Error, ErrorClass, Result};
