//! In-memory storage substrate
//!
//! Writers are serialized by a parking_lot mutex held for the lifetime of the
//! write transaction. Writes are staged and only become visible on commit.

use crate::storage::{Storage, Table, WriteTransaction};
use crate::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type Tables = HashMap<Table, BTreeMap<String, Vec<u8>>>;

/// In-memory transactional key-value store
#[derive(Default)]
pub struct MemoryStorage {
    /// Committed data
    tables: RwLock<Tables>,
    /// Single-writer slot
    writer: Mutex<()>,
    /// Number of successful commits
    commits: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed write transactions
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of committed keys in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }

    /// Whether a table holds no committed keys
    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }
}

impl Storage for MemoryStorage {
    fn write_txn(&self, timeout: Option<Duration>) -> Result<Box<dyn WriteTransaction + '_>> {
        let guard = match timeout {
            Some(timeout) => self.writer.try_lock_for(timeout).ok_or_else(|| {
                Error::transaction(format!(
                    "Timed out after {:?} waiting for the write transaction",
                    timeout
                ))
            })?,
            None => self.writer.lock(),
        };

        Ok(Box::new(MemoryWriteTransaction {
            storage: self,
            _guard: guard,
            staged: HashMap::new(),
        }))
    }

    fn read(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|t| t.get(key))
            .cloned())
    }
}

struct MemoryWriteTransaction<'a> {
    storage: &'a MemoryStorage,
    _guard: MutexGuard<'a, ()>,
    /// `None` marks a staged delete
    staged: HashMap<(Table, String), Option<Vec<u8>>>,
}

impl WriteTransaction for MemoryWriteTransaction<'_> {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(table, key.to_string())) {
            return Ok(staged.clone());
        }
        self.storage.read(table, key)
    }

    fn put(&mut self, table: Table, key: &str, value: &[u8]) -> Result<()> {
        self.staged
            .insert((table, key.to_string()), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &str) -> Result<bool> {
        let existed = self.get(table, key)?.is_some();
        self.staged.insert((table, key.to_string()), None);
        Ok(existed)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        {
            let mut tables = this.storage.tables.write();
            for ((table, key), value) in this.staged {
                let table = tables.entry(table).or_default();
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        this.storage.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_commit_makes_writes_visible() {
        let storage = MemoryStorage::new();

        let mut txn = storage.write_txn(None).unwrap();
        txn.put(Table::Documents, "users/1", b"{}").unwrap();
        assert!(storage.read(Table::Documents, "users/1").unwrap().is_none());
        assert_eq!(
            txn.get(Table::Documents, "users/1").unwrap(),
            Some(b"{}".to_vec())
        );
        txn.commit().unwrap();

        assert_eq!(
            storage.read(Table::Documents, "users/1").unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn test_drop_aborts() {
        let storage = MemoryStorage::new();
        {
            let mut txn = storage.write_txn(None).unwrap();
            txn.put(Table::Documents, "users/1", b"{}").unwrap();
        }
        assert!(storage.is_empty(Table::Documents));
        assert_eq!(storage.commit_count(), 0);
    }

    #[test]
    fn test_delete() {
        let storage = MemoryStorage::new();
        let mut txn = storage.write_txn(None).unwrap();
        txn.put(Table::Documents, "a", b"1").unwrap();
        txn.commit().unwrap();

        let mut txn = storage.write_txn(None).unwrap();
        assert!(txn.delete(Table::Documents, "a").unwrap());
        assert!(!txn.delete(Table::Documents, "missing").unwrap());
        assert!(txn.get(Table::Documents, "a").unwrap().is_none());
        txn.commit().unwrap();

        assert!(storage.read(Table::Documents, "a").unwrap().is_none());
    }

    #[test]
    fn test_single_writer_timeout() {
        let storage = Arc::new(MemoryStorage::new());
        let _held = storage.write_txn(None).unwrap();

        let result = storage.write_txn(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(Error::Transaction(_))));
    }
}
