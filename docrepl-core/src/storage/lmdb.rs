//! LMDB storage substrate (heed)
//!
//! LMDB already serializes writers: `write_txn` blocks until the previous
//! write transaction commits or aborts, so the timeout argument is ignored.
//!
//! Keys above LMDB's key size limit (revision tombstones are keyed by whole
//! change vectors) are stored under a digest of the key instead.

use crate::storage::{Storage, Table, WriteTransaction};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default LMDB map size per partition (1 GiB)
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Largest key LMDB accepts with its default page size
pub const MAX_KEY_SIZE: usize = 511;

/// Prefix of digested keys
const DIGEST_KEY_PREFIX: &str = "sha256:";

/// Key actually stored for `key`
fn stored_key(key: &str) -> Cow<'_, str> {
    if key.len() <= MAX_KEY_SIZE {
        return Cow::Borrowed(key);
    }
    let digest = STANDARD.encode(Sha256::digest(key.as_bytes()));
    Cow::Owned(format!("{}{}", DIGEST_KEY_PREFIX, digest))
}

/// heed-backed partition store
pub struct LmdbStorage {
    env: Env,
    tables: HashMap<Table, Database<Str, Bytes>>,
}

impl LmdbStorage {
    /// Open (or create) a partition environment at `path`
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(Table::ALL.len() as u32)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let mut tables = HashMap::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let db: Database<Str, Bytes> = env.create_database(&mut wtxn, Some(table.name()))?;
            tables.insert(table, db);
        }
        wtxn.commit()?;

        tracing::debug!("Opened LMDB partition store at {}", path.display());

        Ok(Self { env, tables })
    }

    fn db(&self, table: Table) -> Result<Database<Str, Bytes>> {
        self.tables
            .get(&table)
            .copied()
            .ok_or_else(|| Error::storage(format!("Table {} not opened", table.name())))
    }
}

impl Storage for LmdbStorage {
    fn write_txn(&self, _timeout: Option<Duration>) -> Result<Box<dyn WriteTransaction + '_>> {
        let txn = self.env.write_txn()?;
        Ok(Box::new(LmdbWriteTransaction { storage: self, txn }))
    }

    fn read(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db(table)?;
        let rtxn = self.env.read_txn()?;
        let value = db.get(&rtxn, stored_key(key).as_ref())?.map(<[u8]>::to_vec);
        Ok(value)
    }
}

struct LmdbWriteTransaction<'env> {
    storage: &'env LmdbStorage,
    txn: RwTxn<'env>,
}

impl WriteTransaction for LmdbWriteTransaction<'_> {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
        let db = self.storage.db(table)?;
        Ok(db.get(&self.txn, stored_key(key).as_ref())?.map(<[u8]>::to_vec))
    }

    fn put(&mut self, table: Table, key: &str, value: &[u8]) -> Result<()> {
        let db = self.storage.db(table)?;
        db.put(&mut self.txn, stored_key(key).as_ref(), value)?;
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &str) -> Result<bool> {
        let db = self.storage.db(table)?;
        Ok(db.delete(&mut self.txn, stored_key(key).as_ref())?)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ReplicationState;
    use tempfile::TempDir;

    fn open_test_storage() -> (LmdbStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = LmdbStorage::open(dir.path().join("p0"), 16 * 1024 * 1024).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_put_commit_read() {
        let (storage, _dir) = open_test_storage();

        let mut txn = storage.write_txn(None).unwrap();
        txn.put(Table::Documents, "users/1", b"alice").unwrap();
        assert_eq!(
            txn.get(Table::Documents, "users/1").unwrap(),
            Some(b"alice".to_vec())
        );
        txn.commit().unwrap();

        assert_eq!(
            storage.read(Table::Documents, "users/1").unwrap(),
            Some(b"alice".to_vec())
        );
        assert!(storage.read(Table::Tombstones, "users/1").unwrap().is_none());
    }

    #[test]
    fn test_abort_on_drop() {
        let (storage, _dir) = open_test_storage();
        {
            let mut txn = storage.write_txn(None).unwrap();
            txn.put(Table::Counters, "users/1/likes", b"1").unwrap();
        }
        assert!(storage.read(Table::Counters, "users/1/likes").unwrap().is_none());
    }

    #[test]
    fn test_key_above_lmdb_limit() {
        let (storage, _dir) = open_test_storage();
        let change_vector = (0..40)
            .map(|i| format!("N{}:{}-database-instance-{:04}", i, 1000 + i, i))
            .collect::<Vec<_>>()
            .join(", ");
        assert!(change_vector.len() > MAX_KEY_SIZE);

        let mut txn = storage.write_txn(None).unwrap();
        txn.put(Table::RevisionTombstones, &change_vector, b"tombstone").unwrap();
        assert!(txn.get(Table::RevisionTombstones, &change_vector).unwrap().is_some());
        txn.commit().unwrap();

        assert_eq!(
            storage.read(Table::RevisionTombstones, &change_vector).unwrap(),
            Some(b"tombstone".to_vec())
        );

        // A vector sharing the long prefix maps to its own key
        let other = format!("{}, Z:1-dbZ", change_vector);
        assert!(storage.read(Table::RevisionTombstones, &other).unwrap().is_none());

        let mut txn = storage.write_txn(None).unwrap();
        assert!(txn.delete(Table::RevisionTombstones, &change_vector).unwrap());
        txn.commit().unwrap();
        assert!(storage.read(Table::RevisionTombstones, &change_vector).unwrap().is_none());
    }

    #[test]
    fn test_short_keys_stored_verbatim() {
        assert!(matches!(stored_key("users/1"), Cow::Borrowed("users/1")));
        let long = "k".repeat(MAX_KEY_SIZE + 1);
        let key = stored_key(&long);
        assert!(key.starts_with(DIGEST_KEY_PREFIX));
        assert!(key.len() <= MAX_KEY_SIZE);
    }

    #[test]
    fn test_state_visible_after_commit() {
        let (storage, _dir) = open_test_storage();

        let mut state = ReplicationState::default();
        state.last_etag_from.insert("dbA".into(), 7);
        state.database_change_vector = "A:7-dbA".into();

        let mut txn = storage.write_txn(None).unwrap();
        txn.write_state(&state).unwrap();
        txn.commit().unwrap();

        assert_eq!(storage.read_last_state().unwrap(), Some(state));
    }
}
