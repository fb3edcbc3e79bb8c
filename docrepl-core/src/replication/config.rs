//! Replication configuration

use crate::replication::{DEFAULT_MAX_ITEMS_PER_BATCH, DEFAULT_REPLICATION_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Durations are written as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Transaction merger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// Maximum number of commands folded into one write transaction
    pub max_batch_size: usize,

    /// Capacity of the submission queue
    pub queue_capacity: usize,

    /// Maximum wait for the write transaction
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,

    /// Instance ids of retired databases; their entries are dropped from
    /// every change vector this node stores
    pub ignored_db_ids: HashSet<String>,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            queue_capacity: 1024,
            write_timeout: Duration::from_secs(15),
            ignored_db_ids: HashSet::new(),
        }
    }
}

/// Incoming replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Tag of this node, echoed in `Ok` replies
    pub node_tag: String,

    /// Address to bind for incoming replication connections
    pub bind_addr: SocketAddr,

    /// Number of storage partitions
    pub partition_count: usize,

    /// Largest accepted frame payload
    pub max_frame_size: usize,

    /// Largest accepted `ItemsCount`
    pub max_items_per_batch: usize,

    /// Largest accepted `AttachmentStreamsCount`
    pub max_attachment_streams_per_batch: usize,

    /// Largest accepted attachment payload
    pub max_attachment_size: u64,

    /// Capacity of each partition worker's slice queue
    pub partition_queue_capacity: usize,

    /// Transaction merger settings, applied to every partition
    pub merger: MergerConfig,

    /// While a connection received a message within this span, a new
    /// connection from the same source is refused
    #[serde(rename = "active_connection_timeout_ms", with = "duration_ms")]
    pub active_connection_timeout: Duration,

    /// How long a connection may stay silent between messages
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_tag: "A".to_string(),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_REPLICATION_PORT)),
            partition_count: 1,
            max_frame_size: 64 * 1024 * 1024,
            max_items_per_batch: DEFAULT_MAX_ITEMS_PER_BATCH,
            max_attachment_streams_per_batch: 1024,
            max_attachment_size: 256 * 1024 * 1024,
            partition_queue_capacity: 4,
            merger: MergerConfig::default(),
            active_connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ReplicationConfig {
    /// Create a configuration for a node
    pub fn new(node_tag: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_tag: node_tag.into(),
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the number of partitions
    pub fn with_partitions(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Set the frame size limit
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set how long a connection counts as active for its source
    pub fn with_active_connection_timeout(mut self, timeout: Duration) -> Self {
        self.active_connection_timeout = timeout;
        self
    }

    /// Set the connection idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Drop entries of these instance ids from stored change vectors
    pub fn with_ignored_db_ids<I, S>(mut self, db_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merger.ignored_db_ids = db_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the merger batch size
    pub fn with_merger_batch_size(mut self, max_batch_size: usize) -> Self {
        self.merger.max_batch_size = max_batch_size;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.node_tag.is_empty() {
            return Err("node_tag must not be empty".into());
        }

        if self.node_tag.contains([':', '-', ',']) {
            return Err(format!(
                "node_tag '{}' must not contain ':', '-' or ','",
                self.node_tag
            ));
        }

        if self.partition_count == 0 {
            return Err("partition_count must be at least 1".into());
        }

        if self.max_frame_size < 1024 {
            return Err("max_frame_size must be at least 1024".into());
        }

        if self.max_items_per_batch == 0 {
            return Err("max_items_per_batch must be at least 1".into());
        }

        if self.partition_queue_capacity == 0 {
            return Err("partition_queue_capacity must be at least 1".into());
        }

        if self.merger.max_batch_size == 0 {
            return Err("merger.max_batch_size must be at least 1".into());
        }

        if self.merger.queue_capacity == 0 {
            return Err("merger.queue_capacity must be at least 1".into());
        }

        if self.active_connection_timeout.is_zero() {
            return Err("active_connection_timeout must be positive".into());
        }

        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be positive".into());
        }

        if let Some(db_id) = self
            .merger
            .ignored_db_ids
            .iter()
            .find(|id| id.is_empty() || id.contains([':', ',']))
        {
            return Err(format!("ignored db id '{}' is not a valid instance id", db_id));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.partition_count, 1);
        assert_eq!(config.max_items_per_batch, 16 * 1024);
        assert_eq!(config.active_connection_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.merger.ignored_db_ids.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ReplicationConfig::new("B", addr)
            .with_partitions(4)
            .with_merger_batch_size(8);
        assert_eq!(config.node_tag, "B");
        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.merger.max_batch_size, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = ReplicationConfig::default().with_partitions(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_tag_with_separator_rejected() {
        let mut config = ReplicationConfig::default();
        config.node_tag = "A:1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations_as_millis() {
        let json = r#"{"node_tag":"C","partition_count":2,"active_connection_timeout_ms":1500,
            "idle_timeout_ms":9000,"merger":{"write_timeout_ms":250,"ignored_db_ids":["dbOld"]}}"#;
        let config: ReplicationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.node_tag, "C");
        assert_eq!(config.partition_count, 2);
        assert_eq!(config.active_connection_timeout, Duration::from_millis(1500));
        assert_eq!(config.merger.write_timeout, Duration::from_millis(250));
        assert_eq!(config.idle_timeout, Duration::from_secs(9));
        assert_eq!(config.merger.max_batch_size, 64);
        assert!(config.merger.ignored_db_ids.contains("dbOld"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["active_connection_timeout_ms"], 1500);
        assert_eq!(back["idle_timeout_ms"], 9000);
    }

    #[test]
    fn test_ignored_db_ids() {
        let config = ReplicationConfig::default().with_ignored_db_ids(["dbOld", "dbRetired"]);
        assert_eq!(config.merger.ignored_db_ids.len(), 2);
        assert!(config.validate().is_ok());

        let bad = ReplicationConfig::default().with_ignored_db_ids(["A:1-dbA"]);
        assert!(bad.validate().is_err());
    }
}
