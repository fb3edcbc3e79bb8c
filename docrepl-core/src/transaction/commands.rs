//! Merged transaction commands
//!
//! A command is one unit of work for the [`TransactionMerger`]: it mutates the
//! partition inside the write transaction it is given and can describe itself
//! as a serializable DTO, so the merger can rebuild it and run it again in a
//! fresh transaction after a failed merged attempt.
//!
//! [`TransactionMerger`]: crate::transaction::TransactionMerger

use crate::change_vector::{ChangeVector, ConflictStatus};
use crate::replication::items::ReplicationItem;
use crate::storage::records::{
    self, AttachmentRecord, CounterRecord, DeletedRangeRecord, DocumentRecord, TimeSeriesRecord,
    TombstoneRecord, Versioned,
};
use crate::storage::{Table, WriteTransaction};
use crate::transaction::context::OperationContext;
use crate::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Work executed inside an exclusive write transaction
pub trait MergedTransactionCommand: Send + 'static {
    /// Value handed back to the submitter
    type Output: Send + 'static;

    /// Serializable description used to rebuild the command
    type Dto: ReplayableCommandDto<Command = Self> + Serialize + DeserializeOwned;

    /// Apply the command; any error aborts the whole transaction
    fn execute(
        &mut self,
        ctx: &mut OperationContext,
        txn: &mut dyn WriteTransaction,
    ) -> Result<Self::Output>;

    /// Describe the command
    fn to_dto(&self) -> Self::Dto;
}

/// DTO that can be turned back into its command
pub trait ReplayableCommandDto {
    /// Command rebuilt from this DTO
    type Command;

    /// Rebuild the command
    fn into_command(self) -> Result<Self::Command>;
}

/// What applying one partition slice did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSlice {
    /// Items written
    pub applied: usize,
    /// Items whose change was already merged into stored state
    pub skipped: usize,
}

/// Apply one partition's share of an incoming replication batch
#[derive(Debug, Clone)]
pub struct ApplyReplicationBatchCommand {
    source: String,
    last_document_etag: i64,
    items: Vec<ReplicationItem>,
}

/// Serialized form of [`ApplyReplicationBatchCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReplicationBatchCommandDto {
    /// Identity of the sending connection
    pub source: String,
    /// Sender's last document etag of the batch
    pub last_document_etag: i64,
    /// Slice items, attachment streams included
    pub items: Vec<ReplicationItem>,
}

impl ReplayableCommandDto for ApplyReplicationBatchCommandDto {
    type Command = ApplyReplicationBatchCommand;

    fn into_command(self) -> Result<ApplyReplicationBatchCommand> {
        Ok(ApplyReplicationBatchCommand::new(
            self.source,
            self.last_document_etag,
            self.items,
        ))
    }
}

/// Outcome of comparing an incoming change with the stored version
enum Resolution {
    /// Stored state already has this change
    Skip,
    /// Write the change with this change vector
    Write(ChangeVector),
}

impl ApplyReplicationBatchCommand {
    /// Create a command for one slice
    pub fn new(source: impl Into<String>, last_document_etag: i64, items: Vec<ReplicationItem>) -> Self {
        Self {
            source: source.into(),
            last_document_etag,
            items,
        }
    }

    /// Items of the slice
    pub fn items(&self) -> &[ReplicationItem] {
        &self.items
    }

    fn resolve(
        ctx: &mut OperationContext,
        incoming: &str,
        stored: Option<&str>,
        what: &str,
        key: &str,
    ) -> Result<Resolution> {
        let mut incoming = ChangeVector::parse(incoming)?.strip_transaction_tags();
        if incoming.remove_ids(ctx.db_ids_to_ignore()) > 0 {
            // Dropped entries may make stored vectors look newer than ours
            ctx.set_skip_change_vector_validation();
        }
        let Some(stored) = stored else {
            return Ok(Resolution::Write(incoming));
        };

        let mut stored = ChangeVector::parse(stored)?;
        stored.remove_ids(ctx.db_ids_to_ignore());
        match ChangeVector::compare(&incoming, &stored) {
            ConflictStatus::AlreadyMerged => Ok(Resolution::Skip),
            ConflictStatus::Update => Ok(Resolution::Write(incoming)),
            ConflictStatus::Conflict => {
                let merged = ChangeVector::merge(&incoming, &stored);
                tracing::warn!(
                    "Conflict on {} {}: incoming {} vs stored {}, taking incoming as {}",
                    what,
                    key,
                    incoming,
                    stored,
                    merged
                );
                Ok(Resolution::Write(merged))
            }
        }
    }

    fn put<T: Serialize>(
        ctx: &mut OperationContext,
        txn: &mut dyn WriteTransaction,
        table: Table,
        key: &str,
        record: &T,
    ) -> Result<()> {
        let scratch = ctx.scratch();
        records::encode_into(scratch, record)?;
        txn.put(table, key, scratch)
    }

    fn apply_item(
        &self,
        ctx: &mut OperationContext,
        txn: &mut dyn WriteTransaction,
        item: &ReplicationItem,
        streams: &HashMap<&str, &Bytes>,
    ) -> Result<Option<ChangeVector>> {
        match item {
            ReplicationItem::Document {
                header,
                id,
                collection,
                data,
            } => {
                let key = id.to_lowercase();
                let stored = stored_document_vector(txn, &key)?;
                let Resolution::Write(cv) =
                    Self::resolve(ctx, &header.change_vector, stored.as_deref(), "document", id)?
                else {
                    return Ok(None);
                };
                let record = DocumentRecord {
                    id: id.clone(),
                    collection: collection.clone(),
                    data: data.to_vec(),
                    flags: header.flags,
                    change_vector: cv.serialize(),
                    last_modified: header.last_modified,
                };
                Self::put(ctx, txn, Table::Documents, &key, &record)?;
                txn.delete(Table::Tombstones, &key)?;
                Ok(Some(cv))
            }
            ReplicationItem::DocumentTombstone {
                header,
                id,
                collection,
            } => {
                let key = id.to_lowercase();
                let stored = stored_document_vector(txn, &key)?;
                let Resolution::Write(cv) =
                    Self::resolve(ctx, &header.change_vector, stored.as_deref(), "tombstone", id)?
                else {
                    return Ok(None);
                };
                let record = TombstoneRecord {
                    id: id.clone(),
                    collection: collection.clone(),
                    flags: header.flags,
                    change_vector: cv.serialize(),
                    last_modified: header.last_modified,
                };
                Self::put(ctx, txn, Table::Tombstones, &key, &record)?;
                txn.delete(Table::Documents, &key)?;
                Ok(Some(cv))
            }
            ReplicationItem::Attachment {
                header,
                document_id,
                name,
                content_type,
                hash,
            } => {
                let key = sub_key(&[document_id, name]);
                let stored = stored_vector::<AttachmentRecord>(txn, Table::Attachments, &key)?;
                let Resolution::Write(cv) = Self::resolve(
                    ctx,
                    &header.change_vector,
                    stored.as_deref(),
                    "attachment",
                    &key,
                )?
                else {
                    return Ok(None);
                };

                match streams.get(hash.as_str()) {
                    Some(data) => txn.put(Table::AttachmentBlobs, hash, data)?,
                    None if txn.get(Table::AttachmentBlobs, hash)?.is_some() => {}
                    None => return Err(Error::missing_attachment(hash.clone(), document_id.clone())),
                }

                let record = AttachmentRecord {
                    document_id: document_id.clone(),
                    name: name.clone(),
                    content_type: content_type.clone(),
                    hash: hash.clone(),
                    change_vector: cv.serialize(),
                };
                Self::put(ctx, txn, Table::Attachments, &key, &record)?;
                Ok(Some(cv))
            }
            ReplicationItem::AttachmentTombstone {
                header,
                document_id,
                name,
            } => {
                let key = sub_key(&[document_id, name]);
                let stored = stored_vector::<AttachmentRecord>(txn, Table::Attachments, &key)?;
                let Resolution::Write(cv) = Self::resolve(
                    ctx,
                    &header.change_vector,
                    stored.as_deref(),
                    "attachment tombstone",
                    &key,
                )?
                else {
                    return Ok(None);
                };
                txn.delete(Table::Attachments, &key)?;
                Ok(Some(cv))
            }
            // Payloads are consumed by their attachment items
            ReplicationItem::AttachmentStream { .. } => Ok(None),
            ReplicationItem::Counter {
                header,
                document_id,
                name,
                values,
            } => {
                let key = sub_key(&[document_id, name]);
                let stored = stored_vector::<CounterRecord>(txn, Table::Counters, &key)?;
                let Resolution::Write(cv) =
                    Self::resolve(ctx, &header.change_vector, stored.as_deref(), "counter", &key)?
                else {
                    return Ok(None);
                };
                let record = CounterRecord {
                    document_id: document_id.clone(),
                    name: name.clone(),
                    values: values.to_vec(),
                    change_vector: cv.serialize(),
                };
                Self::put(ctx, txn, Table::Counters, &key, &record)?;
                Ok(Some(cv))
            }
            ReplicationItem::TimeSeries {
                header,
                document_id,
                name,
                collection,
                baseline,
                segment,
            } => {
                let millis = baseline.timestamp_millis().to_string();
                let key = sub_key(&[document_id, name, &millis]);
                let stored = stored_vector::<TimeSeriesRecord>(txn, Table::TimeSeries, &key)?;
                let Resolution::Write(cv) = Self::resolve(
                    ctx,
                    &header.change_vector,
                    stored.as_deref(),
                    "time-series segment",
                    &key,
                )?
                else {
                    return Ok(None);
                };
                let record = TimeSeriesRecord {
                    document_id: document_id.clone(),
                    name: name.clone(),
                    collection: collection.clone(),
                    baseline: *baseline,
                    segment: segment.to_vec(),
                    change_vector: cv.serialize(),
                };
                Self::put(ctx, txn, Table::TimeSeries, &key, &record)?;
                Ok(Some(cv))
            }
            ReplicationItem::TimeSeriesDeletedRange {
                header,
                document_id,
                name,
                collection,
                from,
                to,
            } => {
                let range = format!("{}-{}", from.timestamp_millis(), to.timestamp_millis());
                let key = sub_key(&[document_id, name, &range]);
                let stored =
                    stored_vector::<DeletedRangeRecord>(txn, Table::TimeSeriesRanges, &key)?;
                let Resolution::Write(cv) = Self::resolve(
                    ctx,
                    &header.change_vector,
                    stored.as_deref(),
                    "time-series deleted range",
                    &key,
                )?
                else {
                    return Ok(None);
                };
                let record = DeletedRangeRecord {
                    document_id: document_id.clone(),
                    name: name.clone(),
                    collection: collection.clone(),
                    from: *from,
                    to: *to,
                    change_vector: cv.serialize(),
                };
                Self::put(ctx, txn, Table::TimeSeriesRanges, &key, &record)?;
                Ok(Some(cv))
            }
            ReplicationItem::RevisionTombstone {
                header,
                id,
                collection,
            } => {
                if txn.get(Table::RevisionTombstones, id)?.is_some() {
                    return Ok(None);
                }
                let mut cv = ChangeVector::parse(&header.change_vector)?.strip_transaction_tags();
                cv.remove_ids(ctx.db_ids_to_ignore());
                let record = TombstoneRecord {
                    id: id.clone(),
                    collection: collection.clone(),
                    flags: header.flags,
                    change_vector: cv.serialize(),
                    last_modified: header.last_modified,
                };
                Self::put(ctx, txn, Table::RevisionTombstones, id, &record)?;
                Ok(Some(cv))
            }
        }
    }
}

impl MergedTransactionCommand for ApplyReplicationBatchCommand {
    type Output = AppliedSlice;
    type Dto = ApplyReplicationBatchCommandDto;

    fn execute(
        &mut self,
        ctx: &mut OperationContext,
        txn: &mut dyn WriteTransaction,
    ) -> Result<AppliedSlice> {
        let streams: HashMap<&str, &Bytes> = self
            .items
            .iter()
            .filter_map(|item| match item {
                ReplicationItem::AttachmentStream { hash, data } => Some((hash.as_str(), data)),
                _ => None,
            })
            .collect();

        let mut state = txn.read_state()?.unwrap_or_default();
        let previous = ChangeVector::parse(&state.database_change_vector)?;
        if !previous.is_empty() {
            let mut kept = previous.clone();
            if kept.remove_ids(ctx.db_ids_to_ignore()) > 0 {
                ctx.set_skip_change_vector_validation();
            }
            ctx.merge_database_change_vector(&kept)?;
        }

        let mut result = AppliedSlice::default();
        for item in &self.items {
            if matches!(item, ReplicationItem::AttachmentStream { .. }) {
                continue;
            }
            match self.apply_item(ctx, txn, item, &streams)? {
                Some(cv) => {
                    ctx.merge_database_change_vector(&cv)?;
                    result.applied += 1;
                }
                None => result.skipped += 1,
            }
        }

        ctx.record_replication_etag(&self.source, self.last_document_etag);
        for (source, etag) in ctx.last_replication_etag_from() {
            let stored = state.last_etag_from.entry(source.clone()).or_insert(*etag);
            *stored = (*stored).max(*etag);
        }

        if let Some(vector) = ctx.last_database_change_vector() {
            let current = ChangeVector::parse(vector)?;
            if !ctx.skip_change_vector_validation()
                && ChangeVector::compare(&previous, &current) != ConflictStatus::AlreadyMerged
            {
                return Err(Error::internal(format!(
                    "Database change vector {} would lose entries of {}",
                    current, previous
                )));
            }
            state.database_change_vector = vector.to_string();
        }
        txn.write_state(&state)?;

        Ok(result)
    }

    fn to_dto(&self) -> ApplyReplicationBatchCommandDto {
        ApplyReplicationBatchCommandDto {
            source: self.source.clone(),
            last_document_etag: self.last_document_etag,
            items: self.items.clone(),
        }
    }
}

/// Lowercased `a|b|c` key of a document-scoped record
fn sub_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("|")
}

fn stored_vector<T: Versioned + DeserializeOwned>(
    txn: &dyn WriteTransaction,
    table: Table,
    key: &str,
) -> Result<Option<String>> {
    txn.get(table, key)?
        .map(|raw| records::decode::<T>(&raw).map(|record| record.change_vector().to_string()))
        .transpose()
}

/// Change vector of the live document or, failing that, its tombstone
fn stored_document_vector(txn: &dyn WriteTransaction, key: &str) -> Result<Option<String>> {
    match stored_vector::<DocumentRecord>(txn, Table::Documents, key)? {
        Some(cv) => Ok(Some(cv)),
        None => stored_vector::<TombstoneRecord>(txn, Table::Tombstones, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::items::{ItemHeader, content_hash};
    use crate::storage::{MemoryStorage, Storage};
    use chrono::{DateTime, Utc};

    fn header(cv: &str, etag: i64) -> ItemHeader {
        ItemHeader::new(cv, etag, DateTime::<Utc>::from_timestamp_millis(1_000).unwrap())
    }

    fn document(id: &str, cv: &str, body: &'static [u8]) -> ReplicationItem {
        ReplicationItem::Document {
            header: header(cv, 1),
            id: id.into(),
            collection: "Users".into(),
            data: Bytes::from_static(body),
        }
    }

    fn run(storage: &MemoryStorage, command: &mut ApplyReplicationBatchCommand) -> Result<AppliedSlice> {
        run_in(storage, &mut OperationContext::new(), command)
    }

    fn run_in(
        storage: &MemoryStorage,
        ctx: &mut OperationContext,
        command: &mut ApplyReplicationBatchCommand,
    ) -> Result<AppliedSlice> {
        let mut txn = storage.write_txn(None)?;
        let result = command.execute(ctx, txn.as_mut())?;
        txn.commit()?;
        Ok(result)
    }

    #[test]
    fn test_apply_documents_and_state() {
        let storage = MemoryStorage::new();
        let mut command = ApplyReplicationBatchCommand::new(
            "peer-1",
            5,
            vec![
                document("users/1", "A:1-dbA", b"{\"n\":1}"),
                document("users/2", "A:2-dbA", b"{\"n\":2}"),
            ],
        );

        let result = run(&storage, &mut command).unwrap();
        assert_eq!(result, AppliedSlice { applied: 2, skipped: 0 });

        let raw = storage.read(Table::Documents, "users/1").unwrap().unwrap();
        let record: DocumentRecord = records::decode(&raw).unwrap();
        assert_eq!(record.data, b"{\"n\":1}");
        assert_eq!(record.change_vector, "A:1-dbA");

        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.last_etag_from.get("peer-1"), Some(&5));
        assert_eq!(state.database_change_vector, "A:2-dbA");
    }

    #[test]
    fn test_replay_is_idempotent() {
        let storage = MemoryStorage::new();
        let items = vec![document("users/1", "A:1-dbA", b"{}")];

        let mut first = ApplyReplicationBatchCommand::new("peer", 1, items.clone());
        run(&storage, &mut first).unwrap();

        let mut replay = first.to_dto().into_command().unwrap();
        let result = run(&storage, &mut replay).unwrap();
        assert_eq!(result, AppliedSlice { applied: 0, skipped: 1 });
        assert_eq!(storage.len(Table::Documents), 1);
    }

    #[test]
    fn test_tombstone_replaces_document() {
        let storage = MemoryStorage::new();
        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new("peer", 1, vec![document("users/1", "A:1-dbA", b"{}")]),
        )
        .unwrap();

        let tombstone = ReplicationItem::DocumentTombstone {
            header: header("A:2-dbA", 2),
            id: "Users/1".into(),
            collection: "Users".into(),
        };
        run(&storage, &mut ApplyReplicationBatchCommand::new("peer", 2, vec![tombstone])).unwrap();

        assert!(storage.read(Table::Documents, "users/1").unwrap().is_none());
        assert!(storage.read(Table::Tombstones, "users/1").unwrap().is_some());
    }

    #[test]
    fn test_conflict_takes_incoming_with_merged_vector() {
        let storage = MemoryStorage::new();
        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new("a", 1, vec![document("users/1", "A:5-dbA", b"old")]),
        )
        .unwrap();
        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new("b", 1, vec![document("users/1", "B:3-dbB", b"new")]),
        )
        .unwrap();

        let raw = storage.read(Table::Documents, "users/1").unwrap().unwrap();
        let record: DocumentRecord = records::decode(&raw).unwrap();
        assert_eq!(record.data, b"new");
        assert_eq!(
            ChangeVector::parse(&record.change_vector).unwrap(),
            ChangeVector::parse("A:5-dbA, B:3-dbB").unwrap()
        );
    }

    #[test]
    fn test_attachment_needs_payload() {
        let storage = MemoryStorage::new();
        let payload = Bytes::from_static(b"png bytes");
        let hash = content_hash(&payload);
        let attachment = ReplicationItem::Attachment {
            header: header("A:3-dbA", 3),
            document_id: "users/1".into(),
            name: "photo.png".into(),
            content_type: "image/png".into(),
            hash: hash.clone(),
        };

        let mut without = ApplyReplicationBatchCommand::new("peer", 3, vec![attachment.clone()]);
        let err = run(&storage, &mut without).unwrap_err();
        assert!(matches!(err, Error::MissingAttachment { .. }));
        assert_eq!(storage.commit_count(), 0);

        let stream = ReplicationItem::AttachmentStream {
            hash: hash.clone(),
            data: payload.clone(),
        };
        let mut with = ApplyReplicationBatchCommand::new("peer", 3, vec![attachment, stream]);
        assert_eq!(run(&storage, &mut with).unwrap().applied, 1);
        assert_eq!(
            storage.read(Table::AttachmentBlobs, &hash).unwrap(),
            Some(payload.to_vec())
        );
    }

    #[test]
    fn test_attachment_reuses_stored_blob() {
        let storage = MemoryStorage::new();
        let payload = Bytes::from_static(b"shared");
        let hash = content_hash(&payload);
        let attachment = |doc: &str, cv: &str| ReplicationItem::Attachment {
            header: header(cv, 1),
            document_id: doc.into(),
            name: "a.bin".into(),
            content_type: "application/octet-stream".into(),
            hash: hash.clone(),
        };

        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new(
                "peer",
                1,
                vec![
                    attachment("users/1", "A:1-dbA"),
                    ReplicationItem::AttachmentStream {
                        hash: hash.clone(),
                        data: payload,
                    },
                ],
            ),
        )
        .unwrap();

        let mut second =
            ApplyReplicationBatchCommand::new("peer", 2, vec![attachment("users/2", "A:2-dbA")]);
        assert_eq!(run(&storage, &mut second).unwrap().applied, 1);
        assert_eq!(storage.len(Table::Attachments), 2);
    }

    #[test]
    fn test_transaction_tags_not_stored() {
        let storage = MemoryStorage::new();
        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new(
                "peer",
                1,
                vec![document("users/1", "A:1-dbA, TRXN:7-txdb", b"{}")],
            ),
        )
        .unwrap();

        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.database_change_vector, "A:1-dbA");
    }

    #[test]
    fn test_last_etag_never_moves_back() {
        let storage = MemoryStorage::new();
        run(&storage, &mut ApplyReplicationBatchCommand::new("peer", 10, vec![])).unwrap();
        run(&storage, &mut ApplyReplicationBatchCommand::new("peer", 4, vec![])).unwrap();
        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.last_etag_from.get("peer"), Some(&10));
    }

    #[test]
    fn test_two_sources_in_one_transaction() {
        let storage = MemoryStorage::new();
        let mut ctx = OperationContext::new();
        let mut txn = storage.write_txn(None).unwrap();

        let mut first =
            ApplyReplicationBatchCommand::new("peer-a", 8, vec![document("users/1", "A:8-dbA", b"{}")]);
        let mut second =
            ApplyReplicationBatchCommand::new("peer-b", 3, vec![document("users/2", "B:3-dbB", b"{}")]);
        first.execute(&mut ctx, txn.as_mut()).unwrap();
        second.execute(&mut ctx, txn.as_mut()).unwrap();
        txn.commit().unwrap();

        assert_eq!(ctx.last_replication_etag_from().get("peer-a"), Some(&8));
        assert_eq!(ctx.last_replication_etag_from().get("peer-b"), Some(&3));

        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.last_etag_from.get("peer-a"), Some(&8));
        assert_eq!(state.last_etag_from.get("peer-b"), Some(&3));
        assert_eq!(
            ChangeVector::parse(&state.database_change_vector).unwrap(),
            ChangeVector::parse("A:8-dbA, B:3-dbB").unwrap()
        );
    }

    #[test]
    fn test_ignored_ids_never_stored() {
        let storage = MemoryStorage::new();
        let mut ctx = OperationContext::new();
        ctx.ignore_db_id("dbIgnored");

        let mut command = ApplyReplicationBatchCommand::new(
            "peer",
            5,
            vec![document("users/1", "A:5-dbA, X:5-dbIgnored", b"{}")],
        );
        run_in(&storage, &mut ctx, &mut command).unwrap();
        assert!(ctx.skip_change_vector_validation());

        let raw = storage.read(Table::Documents, "users/1").unwrap().unwrap();
        let record: DocumentRecord = records::decode(&raw).unwrap();
        assert_eq!(record.change_vector, "A:5-dbA");

        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.database_change_vector, "A:5-dbA");
    }

    #[test]
    fn test_retired_id_dropped_from_stored_state() {
        let storage = MemoryStorage::new();
        run(
            &storage,
            &mut ApplyReplicationBatchCommand::new(
                "peer",
                1,
                vec![document("users/1", "A:1-dbA, X:3-dbOld", b"{}")],
            ),
        )
        .unwrap();

        // The stored vector shrinks, which is only allowed for ignored ids
        let mut ctx = OperationContext::new();
        ctx.ignore_db_id("dbOld");
        let mut command =
            ApplyReplicationBatchCommand::new("peer", 2, vec![document("users/2", "A:2-dbA", b"{}")]);
        run_in(&storage, &mut ctx, &mut command).unwrap();

        let state = storage.read_last_state().unwrap().unwrap();
        assert_eq!(state.database_change_vector, "A:2-dbA");
    }

    #[test]
    fn test_dto_serializes() {
        let command =
            ApplyReplicationBatchCommand::new("peer", 3, vec![document("users/1", "A:1-dbA", b"{}")]);
        let json = serde_json::to_string(&command.to_dto()).unwrap();
        let dto: ApplyReplicationBatchCommandDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, command.to_dto());
    }
}
