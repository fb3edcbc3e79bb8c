//! TestContext - temporary directory for on-disk partitions

use crate::storage::LmdbStorage;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Map size for test environments
const TEST_MAP_SIZE: usize = 64 * 1024 * 1024;

/// Owns a temporary directory; everything inside is removed on drop
///
/// Keep the context alive for as long as storages opened from it are in use.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Path of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Open one LMDB environment per partition under `partition-<n>`
    pub fn lmdb_partitions(&self, count: usize) -> Vec<Arc<LmdbStorage>> {
        (0..count)
            .map(|partition| {
                let dir = self.path().join(format!("partition-{}", partition));
                Arc::new(LmdbStorage::open(dir, TEST_MAP_SIZE).expect("Failed to open LMDB partition"))
            })
            .collect()
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
