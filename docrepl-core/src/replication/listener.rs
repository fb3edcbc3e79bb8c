//! TCP accept loop for incoming replication
//!
//! Every accepted connection gets its own [`IncomingReplicationHandler`] task.
//! All handlers share the partition workers, so batches from different
//! senders interleave per partition but never within one connection.
//!
//! Connections are identified by peer IP. A source holds at most one
//! connection; see [`ConnectionRegistry`].

use crate::replication::config::ReplicationConfig;
use crate::replication::handler::IncomingReplicationHandler;
use crate::replication::partition::PartitionWorkers;
use crate::replication::protocol::{ReplicationReply, UNKNOWN_MESSAGE_TYPE};
use crate::replication::registry::ConnectionRegistry;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Listener statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Connections accepted
    pub connections_accepted: u64,
    /// Connections whose handler returned an error
    pub connections_failed: u64,
    /// Connections refused because their source already had an active one
    pub connections_rejected: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Accepts replication connections until cancelled
pub struct ReplicationListener {
    config: Arc<ReplicationConfig>,
    workers: Arc<PartitionWorkers>,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<Counters>,
}

impl ReplicationListener {
    /// Create a listener; nothing is bound until [`ReplicationListener::run`] or [`ReplicationListener::bind`]
    pub fn new(
        config: Arc<ReplicationConfig>,
        workers: Arc<PartitionWorkers>,
        cancel: CancellationToken,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.active_connection_timeout);
        Self {
            config,
            workers,
            cancel,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(
            "Node {} accepting replication on {}",
            self.config.node_tag,
            listener.local_addr()?
        );
        Ok(listener)
    }

    /// Bind and serve until the cancellation token fires
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until the cancellation token fires
    ///
    /// Returns after every connection handler has exited.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = self.spawn_handler(&mut connections, stream, addr) {
                                tracing::error!("Failed to set up handler for {}: {}", addr, e);
                            }
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                // Reap finished handlers so the set does not grow unbounded
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.cancel.cancelled() => {
                    tracing::info!("Replication listener shutting down");
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}
        Ok(())
    }

    fn spawn_handler(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let source = addr.ip().to_string();
        let cancel = self.cancel.child_token();

        let registration = match self.registry.register(&source, cancel.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::info!("Refusing replication connection from {}: {}", addr, e);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                connections.spawn(reject(stream, e.to_string()));
                return Ok(());
            }
        };

        let mut handler = IncomingReplicationHandler::new(
            stream,
            source,
            self.config.clone(),
            self.workers.clone(),
            cancel,
        )?
        .with_activity(registration.activity());
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let counters = self.counters.clone();
        connections.spawn(async move {
            let _registration = registration;
            if handler.run().await.is_err() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(
                "Replication connection from {} closed after {} batches",
                addr,
                handler.stats().batches_applied
            );
        });
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            connections_accepted: self.counters.accepted.load(Ordering::Relaxed),
            connections_failed: self.counters.failed.load(Ordering::Relaxed),
            connections_rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of sources with a registered connection
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }
}

async fn reject(mut stream: TcpStream, reason: String) {
    let reply = ReplicationReply::error(UNKNOWN_MESSAGE_TYPE, reason);
    if let Err(e) = reply.write_to(&mut stream).await {
        tracing::debug!("Failed to send rejection: {}", e);
    }
    let _ = stream.shutdown().await;
}
