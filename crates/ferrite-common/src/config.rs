//! Configuration structures for FerriteDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the disk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskManagerConfig {
    /// Base directory for segment files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Configuration for the buffer manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferManagerConfig {
    /// Base directory for segment files.
    pub data_dir: PathBuf,
    /// Maximum number of pages resident in memory at the same time.
    pub page_count: usize,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_count: 8192, // 32 MB with 4 KB pages
            fsync_enabled: true,
        }
    }
}

impl BufferManagerConfig {
    /// Returns the total buffer size in bytes.
    pub fn buffer_size_bytes(&self) -> usize {
        self.page_count * crate::page::PAGE_SIZE
    }
}
