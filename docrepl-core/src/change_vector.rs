//! Change vectors - causal version vectors for replicated writes
//!
//! A change vector maps every database instance that touched a record to the
//! last etag it produced. The text form is an ordered list of tokens:
//!
//! ```text
//! A:1042-kJ8eUQ7KRkWcYp2Bf3kqSA, B:77-Yc3mZb0uSEqT9q1xj1f8Xw
//! ^ ^    ^
//! | |    instance (database) id, the merge key
//! | etag
//! node tag
//! ```
//!
//! Serialization keeps entry order; equality ignores it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

/// Node tag marking transactional entries that must not be stored
pub const TRANSACTION_TAG: &str = "TRXN";

/// One `TAG:ETAG-INSTANCE` token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVectorEntry {
    /// Node tag of the writer
    pub node_tag: String,
    /// Last etag seen from this instance
    pub etag: i64,
    /// Database instance id
    pub db_id: String,
}

impl ChangeVectorEntry {
    /// Create a new entry
    pub fn new(node_tag: impl Into<String>, etag: i64, db_id: impl Into<String>) -> Self {
        Self {
            node_tag: node_tag.into(),
            etag,
            db_id: db_id.into(),
        }
    }

    fn parse(token: &str) -> Result<Self> {
        let (tag, rest) = token
            .split_once(':')
            .ok_or_else(|| Error::invalid_change_vector(format!("missing ':' in '{}'", token)))?;
        let (etag, db_id) = rest
            .split_once('-')
            .ok_or_else(|| Error::invalid_change_vector(format!("missing '-' in '{}'", token)))?;

        if tag.is_empty() || db_id.is_empty() {
            return Err(Error::invalid_change_vector(format!(
                "empty tag or instance id in '{}'",
                token
            )));
        }
        if etag.is_empty() || !etag.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_change_vector(format!(
                "bad etag in '{}'",
                token
            )));
        }
        let etag = etag
            .parse::<i64>()
            .map_err(|e| Error::invalid_change_vector(format!("bad etag in '{}': {}", token, e)))?;

        Ok(Self::new(tag, etag, db_id))
    }

    fn is_transactional(&self) -> bool {
        self.node_tag == TRANSACTION_TAG
    }
}

impl fmt::Display for ChangeVectorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.node_tag, self.etag, self.db_id)
    }
}

/// Result of comparing an incoming vector with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStatus {
    /// Incoming vector strictly advances the stored one
    Update,
    /// Stored state already contains everything the incoming vector knows
    AlreadyMerged,
    /// Concurrent writes, neither vector covers the other
    Conflict,
}

/// Ordered change vector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeVector {
    entries: Vec<ChangeVectorEntry>,
}

impl ChangeVector {
    /// Create an empty change vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a vector from entries, rejecting duplicate instance ids
    pub fn from_entries(entries: Vec<ChangeVectorEntry>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.db_id.as_str()) {
                return Err(Error::invalid_change_vector(format!(
                    "duplicate instance id '{}'",
                    entry.db_id
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Parse the token form; an empty string yields an empty vector
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::new());
        }

        let entries = text
            .split(',')
            .map(|token| {
                let token = token.trim();
                if token.is_empty() {
                    return Err(Error::invalid_change_vector("empty token"));
                }
                ChangeVectorEntry::parse(token)
            })
            .collect::<Result<Vec<_>>>()?;

        Self::from_entries(entries)
    }

    /// Serialize to the token form, preserving entry order
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[ChangeVectorEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the vector has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last etag recorded for an instance
    pub fn etag_for(&self, db_id: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.db_id == db_id)
            .map(|e| e.etag)
    }

    /// Per-instance maximum of two vectors
    ///
    /// Keeps `a`'s order and appends instances only `b` knows, in `b`'s order.
    pub fn merge(a: &ChangeVector, b: &ChangeVector) -> ChangeVector {
        let mut merged = a.clone();
        merged.merge_with(b);
        merged
    }

    /// In-place variant of [`ChangeVector::merge`]
    pub fn merge_with(&mut self, other: &ChangeVector) {
        for incoming in &other.entries {
            match self.entries.iter_mut().find(|e| e.db_id == incoming.db_id) {
                Some(existing) => {
                    if incoming.etag > existing.etag {
                        existing.etag = incoming.etag;
                        existing.node_tag.clone_from(&incoming.node_tag);
                    }
                }
                None => self.entries.push(incoming.clone()),
            }
        }
    }

    /// Drop every transactional entry
    pub fn strip_transaction_tags(&self) -> ChangeVector {
        ChangeVector {
            entries: self
                .entries
                .iter()
                .filter(|e| !e.is_transactional())
                .cloned()
                .collect(),
        }
    }

    /// Remove entries whose instance id is in `ignore`, returning how many went
    pub fn remove_ids(&mut self, ignore: &HashSet<String>) -> usize {
        if ignore.is_empty() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|e| !ignore.contains(&e.db_id));
        before - self.entries.len()
    }

    /// Compare an incoming vector against the stored one
    pub fn compare(incoming: &ChangeVector, stored: &ChangeVector) -> ConflictStatus {
        if stored.covers(incoming) {
            ConflictStatus::AlreadyMerged
        } else if incoming.covers(stored) {
            ConflictStatus::Update
        } else {
            ConflictStatus::Conflict
        }
    }

    /// Whether every entry of `other` is at or below this vector's etag
    fn covers(&self, other: &ChangeVector) -> bool {
        other
            .entries
            .iter()
            .all(|e| self.etag_for(&e.db_id).is_some_and(|etag| etag >= e.etag))
    }
}

/// Equality over (instance id, etag) pairs, independent of order
impl PartialEq for ChangeVector {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|e| other.etag_for(&e.db_id) == Some(e.etag))
    }
}

impl Eq for ChangeVector {}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ChangeVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Strip transactional entries from a serialized vector
///
/// Returns the input untouched when it carries no transactional entry.
pub fn strip_transaction_tags(text: &str) -> Result<Cow<'_, str>> {
    if !text.contains(TRANSACTION_TAG) {
        return Ok(Cow::Borrowed(text));
    }
    let vector = ChangeVector::parse(text)?;
    let stripped = vector.strip_transaction_tags();
    if stripped.len() == vector.len() {
        return Ok(Cow::Borrowed(text));
    }
    Ok(Cow::Owned(stripped.serialize()))
}

/// Remove ignored instance ids from a serialized vector
///
/// The original string is reused when nothing was removed.
pub fn remove_ids<'a>(text: &'a str, ignore: &HashSet<String>) -> Result<(Cow<'a, str>, usize)> {
    if ignore.is_empty() || text.is_empty() {
        return Ok((Cow::Borrowed(text), 0));
    }
    let mut vector = ChangeVector::parse(text)?;
    let removed = vector.remove_ids(ignore);
    if removed > 0 {
        Ok((Cow::Owned(vector.serialize()), removed))
    } else {
        Ok((Cow::Borrowed(text), 0))
    }
}
