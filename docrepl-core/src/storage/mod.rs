//! Storage substrate interface
//!
//! The storage engine itself lives outside this crate. The replication core
//! only needs an exclusive write transaction with `get`/`put`/`delete`/`commit`
//! and the replication state pair (`read_last_state` / `write_state`).
//!
//! Two adapters are provided:
//! - [`MemoryStorage`]: staged writes under a single-writer mutex, used by tests
//!   and ephemeral nodes
//! - [`LmdbStorage`]: heed environment, one named database per [`Table`]

pub mod lmdb;
pub mod memory;
pub mod records;

pub use lmdb::LmdbStorage;
pub use memory::MemoryStorage;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Key under which [`ReplicationState`] is stored in [`Table::State`]
pub const STATE_KEY: &str = "replication-state";

/// Logical tables of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Live documents by lowercased id
    Documents,
    /// Document tombstones by lowercased id
    Tombstones,
    /// Attachment metadata by `doc|name`
    Attachments,
    /// Attachment content by content hash
    AttachmentBlobs,
    /// Counter groups by `doc|name`
    Counters,
    /// Time-series segments by `doc|name|baseline`
    TimeSeries,
    /// Deleted time-series ranges by `doc|name|from-to`
    TimeSeriesRanges,
    /// Revision tombstones by revision change vector
    RevisionTombstones,
    /// Replication bookkeeping
    State,
}

impl Table {
    /// All tables, in creation order
    pub const ALL: [Table; 9] = [
        Table::Documents,
        Table::Tombstones,
        Table::Attachments,
        Table::AttachmentBlobs,
        Table::Counters,
        Table::TimeSeries,
        Table::TimeSeriesRanges,
        Table::RevisionTombstones,
        Table::State,
    ];

    /// Name of the backing database
    pub fn name(self) -> &'static str {
        match self {
            Table::Documents => "documents",
            Table::Tombstones => "tombstones",
            Table::Attachments => "attachments",
            Table::AttachmentBlobs => "attachment_blobs",
            Table::Counters => "counters",
            Table::TimeSeries => "time_series",
            Table::TimeSeriesRanges => "time_series_ranges",
            Table::RevisionTombstones => "revision_tombstones",
            Table::State => "state",
        }
    }
}

/// Replication bookkeeping persisted with every applied batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Last etag accepted per source database id
    pub last_etag_from: HashMap<String, i64>,
    /// Database-wide change vector after the last commit
    pub database_change_vector: String,
}

/// Exclusive write transaction
///
/// Dropping a transaction without calling [`WriteTransaction::commit`] aborts it.
pub trait WriteTransaction {
    /// Read a value, seeing this transaction's own writes
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a value
    fn put(&mut self, table: Table, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a value, returning whether it existed
    fn delete(&mut self, table: Table, key: &str) -> Result<bool>;

    /// Make all writes durable and release the writer slot
    fn commit(self: Box<Self>) -> Result<()>;

    /// Read the replication state as seen by this transaction
    fn read_state(&self) -> Result<Option<ReplicationState>> {
        self.get(Table::State, STATE_KEY)?
            .map(|raw| records::decode(&raw))
            .transpose()
    }

    /// Overwrite the replication state
    fn write_state(&mut self, state: &ReplicationState) -> Result<()> {
        let raw = records::encode(state)?;
        self.put(Table::State, STATE_KEY, &raw)
    }
}

/// Transactional key-value substrate backing one partition
pub trait Storage: Send + Sync + 'static {
    /// Open the (single) write transaction, waiting at most `timeout` if given
    fn write_txn(&self, timeout: Option<Duration>) -> Result<Box<dyn WriteTransaction + '_>>;

    /// Read a committed value
    fn read(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read the last committed replication state
    fn read_last_state(&self) -> Result<Option<ReplicationState>> {
        self.read(Table::State, STATE_KEY)?
            .map(|raw| records::decode(&raw))
            .transpose()
    }
}
