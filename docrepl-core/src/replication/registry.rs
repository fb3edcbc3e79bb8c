//! Active incoming connections, at most one per source
//!
//! A source that reconnects while its previous connection still received a
//! message within `active_connection_timeout` is refused. A connection that
//! went quiet for longer is cancelled and replaced by the new one.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Time of the last message seen on a connection
#[derive(Debug)]
pub struct ConnectionActivity {
    last_message: Mutex<Instant>,
}

impl ConnectionActivity {
    fn new() -> Self {
        Self {
            last_message: Mutex::new(Instant::now()),
        }
    }

    /// Record a message
    pub fn touch(&self) {
        *self.last_message.lock() = Instant::now();
    }

    /// Time since the last message, or since registration
    pub fn idle_for(&self) -> Duration {
        self.last_message.lock().elapsed()
    }
}

struct ActiveConnection {
    id: u64,
    activity: Arc<ConnectionActivity>,
    cancel: CancellationToken,
}

/// Registry of active connections keyed by source
pub struct ConnectionRegistry {
    active_timeout: Duration,
    next_id: AtomicU64,
    active: Mutex<HashMap<String, ActiveConnection>>,
}

impl ConnectionRegistry {
    /// Create a registry
    pub fn new(active_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            active_timeout,
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Register a connection from `source`
    ///
    /// `cancel` stops the connection should a later one replace it. The entry
    /// is released when the returned registration drops.
    pub fn register(
        self: &Arc<Self>,
        source: &str,
        cancel: CancellationToken,
    ) -> Result<ConnectionRegistration> {
        let mut active = self.active.lock();

        if let Some(existing) = active.get(source) {
            let idle = existing.activity.idle_for();
            if idle < self.active_timeout {
                return Err(Error::connection_rejected(format!(
                    "an active connection from {} already exists (last message {:?} ago)",
                    source, idle
                )));
            }
            tracing::info!(
                "Replacing connection from {} that was idle for {:?}",
                source,
                idle
            );
            existing.cancel.cancel();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let activity = Arc::new(ConnectionActivity::new());
        active.insert(
            source.to_string(),
            ActiveConnection {
                id,
                activity: activity.clone(),
                cancel,
            },
        );

        Ok(ConnectionRegistration {
            registry: self.clone(),
            source: source.to_string(),
            id,
            activity,
        })
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, source: &str, id: u64) {
        let mut active = self.active.lock();
        // A replaced connection must not remove its successor
        if active.get(source).is_some_and(|entry| entry.id == id) {
            active.remove(source);
        }
    }
}

/// A registered connection; unregisters on drop
pub struct ConnectionRegistration {
    registry: Arc<ConnectionRegistry>,
    source: String,
    id: u64,
    activity: Arc<ConnectionActivity>,
}

impl ConnectionRegistration {
    /// Source this connection was registered under
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Activity tracker the handler updates on every message
    pub fn activity(&self) -> Arc<ConnectionActivity> {
        self.activity.clone()
    }
}

impl Drop for ConnectionRegistration {
    fn drop(&mut self) {
        self.registry.release(&self.source, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_second_connection_refused_while_active() {
        let registry = ConnectionRegistry::new(TIMEOUT);
        let first = registry.register("10.0.0.1", CancellationToken::new()).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        first.activity().touch();
        tokio::time::advance(Duration::from_secs(20)).await;

        let err = registry
            .register("10.0.0.1", CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionRejected(_)));
        assert!(err.to_string().contains("10.0.0.1"));

        // Other sources are unaffected
        let _other = registry.register("10.0.0.2", CancellationToken::new()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_replaced() {
        let registry = ConnectionRegistry::new(TIMEOUT);
        let old_cancel = CancellationToken::new();
        let old = registry.register("peer", old_cancel.clone()).unwrap();

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        let new = registry.register("peer", CancellationToken::new()).unwrap();
        assert!(old_cancel.is_cancelled());

        // The replaced connection exiting keeps its successor registered
        drop(old);
        assert_eq!(registry.len(), 1);
        assert_eq!(new.source(), "peer");

        drop(new);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_source_can_reconnect() {
        let registry = ConnectionRegistry::new(TIMEOUT);
        let first = registry.register("peer", CancellationToken::new()).unwrap();
        drop(first);
        assert!(registry.register("peer", CancellationToken::new()).is_ok());
    }
}
