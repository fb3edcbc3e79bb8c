//! Operation context and its pool
//!
//! An [`OperationContext`] carries the transaction-scoped state of one merged
//! write transaction: a scratch arena for record encoding and the change-vector
//! bookkeeping of the replication batch being applied. Contexts are pooled;
//! [`ContextPool::allocate`] resets a context before handing it out, so no
//! transaction can observe what the previous occupant left behind.

use crate::change_vector::{self, ChangeVector};
use crate::Result;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default scratch capacity of a fresh context
const SCRATCH_CAPACITY: usize = 16 * 1024;

/// Transaction-scoped mutable state
#[derive(Debug)]
pub struct OperationContext {
    scratch: BytesMut,
    last_database_change_vector: Option<String>,
    last_replication_etag_from: HashMap<String, i64>,
    db_ids_to_ignore: HashSet<String>,
    skip_change_vector_validation: bool,
    cleared: bool,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationContext {
    /// Create a cleared context
    pub fn new() -> Self {
        Self {
            scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
            last_database_change_vector: None,
            last_replication_etag_from: HashMap::new(),
            db_ids_to_ignore: HashSet::new(),
            skip_change_vector_validation: false,
            cleared: true,
        }
    }

    /// Null out every transaction-scoped field
    pub fn reset(&mut self) {
        self.scratch.clear();
        self.last_database_change_vector = None;
        self.last_replication_etag_from.clear();
        self.db_ids_to_ignore.clear();
        self.skip_change_vector_validation = false;
        self.cleared = true;
    }

    /// Whether nothing was written since the last reset
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    fn touch(&mut self) {
        self.cleared = false;
    }

    /// Scratch arena, emptied on reset
    pub fn scratch(&mut self) -> &mut BytesMut {
        self.touch();
        &mut self.scratch
    }

    /// Database change vector accumulated by this transaction
    pub fn last_database_change_vector(&self) -> Option<&str> {
        self.last_database_change_vector.as_deref()
    }

    /// Record the database change vector to persist on commit
    ///
    /// Transactional entries and ignored instance ids never reach storage.
    pub fn set_last_database_change_vector(&mut self, vector: &str) -> Result<()> {
        self.touch();
        let stripped = change_vector::strip_transaction_tags(vector)?;
        let (filtered, _) = change_vector::remove_ids(&stripped, &self.db_ids_to_ignore)?;
        self.last_database_change_vector = Some(filtered.into_owned());
        Ok(())
    }

    /// Merge `vector` into the accumulated database change vector
    pub fn merge_database_change_vector(&mut self, vector: &ChangeVector) -> Result<()> {
        let mut current = match &self.last_database_change_vector {
            Some(text) => ChangeVector::parse(text)?,
            None => ChangeVector::new(),
        };
        current.merge_with(vector);
        self.set_last_database_change_vector(&current.serialize())
    }

    /// Highest etag per source among the batches applied in this transaction
    pub fn last_replication_etag_from(&self) -> &HashMap<String, i64> {
        &self.last_replication_etag_from
    }

    /// Record a source etag to persist on commit; only ever moves forward
    pub fn record_replication_etag(&mut self, source: &str, etag: i64) {
        self.touch();
        match self.last_replication_etag_from.get_mut(source) {
            Some(current) => *current = (*current).max(etag),
            None => {
                self.last_replication_etag_from.insert(source.to_string(), etag);
            }
        }
    }

    /// Instance ids excluded from causality tracking
    pub fn db_ids_to_ignore(&self) -> &HashSet<String> {
        &self.db_ids_to_ignore
    }

    /// Exclude an instance id from causality tracking
    pub fn ignore_db_id(&mut self, db_id: impl Into<String>) {
        self.touch();
        self.db_ids_to_ignore.insert(db_id.into());
    }

    /// Exclude several instance ids
    pub fn ignore_db_ids<I, S>(&mut self, db_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for db_id in db_ids {
            self.ignore_db_id(db_id);
        }
    }

    /// Whether change-vector validation is skipped for the rest of this transaction
    pub fn skip_change_vector_validation(&self) -> bool {
        self.skip_change_vector_validation
    }

    /// Skip change-vector validation; sticky until reset
    pub fn set_skip_change_vector_validation(&mut self) {
        self.touch();
        self.skip_change_vector_validation = true;
    }
}

/// Pool of reusable contexts
#[derive(Debug, Clone, Default)]
pub struct ContextPool {
    free: Arc<Mutex<Vec<OperationContext>>>,
}

impl ContextPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a reset context
    pub fn allocate(&self) -> PooledContext {
        let mut context = self.free.lock().pop().unwrap_or_default();
        context.reset();
        PooledContext {
            context: Some(context),
            pool: self.free.clone(),
        }
    }

    /// Number of idle contexts
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// Context checked out of a [`ContextPool`]; returned to the pool on drop
#[derive(Debug)]
pub struct PooledContext {
    context: Option<OperationContext>,
    pool: Arc<Mutex<Vec<OperationContext>>>,
}

impl Deref for PooledContext {
    type Target = OperationContext;

    fn deref(&self) -> &OperationContext {
        // Only `drop` takes the context out
        self.context.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut OperationContext {
        self.context.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.lock().push(context);
        }
    }
}
