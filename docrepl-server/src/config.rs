//! Server configuration
//!
//! Sources, lowest priority first: defaults, TOML file, `DOCREPL_*`
//! environment variables, command line flags.

use anyhow::{Context, bail};
use docrepl_core::replication::ReplicationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default LMDB map size per partition (1 GiB)
const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding one LMDB environment per partition
    pub data_dir: PathBuf,
    /// LMDB map size per partition
    pub map_size: usize,
    /// Keep partitions in memory instead of LMDB
    pub in_memory: bool,
    /// Incoming replication settings
    pub replication: ReplicationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            map_size: DEFAULT_MAP_SIZE,
            in_memory: false,
            replication: ReplicationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DOCREPL_*` overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(tag) = lookup("DOCREPL_NODE_TAG") {
            self.replication.node_tag = tag;
        }

        if let Some(addr) = lookup("DOCREPL_BIND_ADDR") {
            self.replication.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid DOCREPL_BIND_ADDR '{}'", addr))?;
        }

        if let Some(partitions) = lookup("DOCREPL_PARTITIONS") {
            self.replication.partition_count = partitions
                .parse()
                .with_context(|| format!("Invalid DOCREPL_PARTITIONS '{}'", partitions))?;
        }

        if let Some(dir) = lookup("DOCREPL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(ids) = lookup("DOCREPL_IGNORED_DB_IDS") {
            self.replication.merger.ignored_db_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(e) = self.replication.validate() {
            bail!("Invalid replication configuration: {}", e);
        }
        if !self.in_memory && self.map_size == 0 {
            bail!("map_size must be positive");
        }
        Ok(())
    }

    /// Directory of one partition's environment
    pub fn partition_dir(&self, partition: usize) -> PathBuf {
        self.data_dir.join(format!("partition-{}", partition))
    }
}
