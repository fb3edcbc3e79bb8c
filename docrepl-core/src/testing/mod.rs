//! Testing infrastructure for docrepl Core
//!
//! Shared helpers for unit and integration tests:
//!
//! - **TestContext**: temporary directory for LMDB partitions, removed on drop
//! - **BatchBuilder**: encodes a complete documents message the way a sending
//!   node puts it on the wire
//! - **ReplicationHarness**: a handler over an in-memory duplex stream with
//!   in-memory partitions behind real transaction mergers
//! - **DelayedApplier**: wraps an applier with per-partition delays and an
//!   event log, for barrier ordering tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use docrepl_core::testing::{BatchBuilder, ReplicationHarness, items};
//!
//! # async fn demo() {
//! let mut harness = ReplicationHarness::start(2);
//! let batch = BatchBuilder::new(10).item(items::document("users/1", "A:10-dbA", 10));
//! let reply = harness.exchange(&batch).await;
//! assert_eq!(reply.last_etag_accepted, 10);
//! # }
//! ```

mod applier;
mod context;
mod harness;
pub mod items;
mod wire;

pub use applier::{ApplyEvent, DelayedApplier};
pub use context::TestContext;
pub use harness::{HARNESS_SOURCE, ReplicationHarness};
pub use wire::{BatchBuilder, heartbeat_frame, poll_frame};
