//! Incoming replication
//!
//! Receives batches of changes from a sending node and applies them to the
//! local partitions:
//!
//! - Framed wire protocol with CRC32 validation and size limits
//! - Typed replication items (documents, tombstones, attachments, counters,
//!   time series, revision tombstones) and spooled attachment streams
//! - Routing by document id onto per-partition queues, with attachment
//!   payload deduplication per partition
//! - Per-partition consumers that commit through the transaction merger
//! - At most one active connection per sending source
//! - A completion barrier so a batch is acknowledged only once every
//!   partition finished it
//!
//! # Architecture
//!
//! ```text
//!  sender ──► ReplicationListener ──► IncomingReplicationHandler (one per connection)
//!                                         │ WireReader: frames, items, spool
//!                                         ▼
//!                                     ReplicationQueue ── ShardRouter + AttachmentDeduplicator
//!                                         │ seal()
//!                ┌────────────────────────┼────────────────────────┐
//!                ▼                        ▼                        ▼
//!          partition 0              partition 1      ...     partition N-1
//!        (PartitionWorkers ──► PartitionApplier ──► TransactionMerger)
//!                └────────────────────────┼────────────────────────┘
//!                                         ▼
//!                               CompletionBarrier ──► reply
//! ```
//!
//! # Wire Protocol
//!
//! ```text
//! [kind:1][length:4][payload:N][crc32:4]
//! ```
//!
//! A documents batch is one `Message` frame (JSON header), `ItemsCount` `Item`
//! frames and `AttachmentStreamsCount` `AttachmentStream` descriptors, each
//! followed by its raw payload.

pub mod barrier;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod handler;
pub mod items;
pub mod listener;
pub mod partition;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod router;
pub mod spool;

pub use barrier::{CompletionBarrier, CompletionToken, PartitionOutcome};
pub use config::{MergerConfig, ReplicationConfig};
pub use dedup::{AttachmentDeduplicator, AttachmentRef};
pub use handler::{BatchOutcome, HandlerState, IncomingReplicationHandler, IncomingStats};
pub use items::{ItemHeader, ItemKind, ReplicationItem, StreamDescriptor, content_hash};
pub use listener::{ListenerStats, ReplicationListener};
pub use partition::{MergerApplier, PartitionApplier, PartitionWorkers};
pub use protocol::{
    BatchHeader, Frame, FrameKind, IncomingMessage, OutgoingHeader, ReplicationReply, ReplyType,
    UNKNOWN_MESSAGE_TYPE,
};
pub use queue::{PartitionSlice, QueueState, ReplicationQueue, SealedBatch};
pub use reader::{IncomingBatch, WireReader};
pub use registry::{ConnectionActivity, ConnectionRegistration, ConnectionRegistry};
pub use router::ShardRouter;
pub use spool::{AttachmentSpool, SpooledStream};

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15480;

/// Default upper bound on `ItemsCount` of one batch
pub const DEFAULT_MAX_ITEMS_PER_BATCH: usize = 16_384;
