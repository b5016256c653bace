use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemDistributedCacheConfig {
    pub path: PathBuf,
}

/// The backend to use for the distributed cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributedCacheConfig {
    /// An in-process map, useful for tests and single-instance setups.
    Memory,
    /// A directory, which may be on a shared network filesystem.
    Filesystem(FilesystemDistributedCacheConfig),
}
