//! Disk manager for segment-file page I/O.
//!
//! Each 16-bit segment id maps to one file under the data directory. A
//! segment file is a packed array of `PAGE_SIZE` blocks with no header;
//! block `k` holds page index `k`. Files grow on demand and never shrink.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferrite_common::{DiskManagerConfig, PageId, Result, PAGE_SIZE};

/// Manages reading and writing pages in per-segment files.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// Open segment handles keyed by segment id.
    segments: RwLock<HashMap<u16, Arc<SegmentHandle>>>,
}

/// Handle for an open segment file.
///
/// Block reads and writes take the latch shared (positional I/O does not
/// move a shared cursor); creation and resize take it exclusively.
struct SegmentHandle {
    inner: RwLock<SegmentFile>,
}

struct SegmentFile {
    file: File,
    /// Current file length in bytes. Always a multiple of PAGE_SIZE.
    size: u64,
}

impl DiskManager {
    /// Creates a new disk manager rooted at the configured data directory.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            segments: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Generates the file path for a given segment id.
    fn segment_path(&self, segment_id: u16) -> PathBuf {
        self.config.data_dir.join(format!("{:05}.seg", segment_id))
    }

    /// Opens or creates the segment file, returning its handle.
    fn handle(&self, segment_id: u16) -> Result<Arc<SegmentHandle>> {
        {
            let segments = self.segments.read();
            if let Some(handle) = segments.get(&segment_id) {
                return Ok(handle.clone());
            }
        }

        let mut segments = self.segments.write();
        // Someone may have opened it while we upgraded.
        if let Some(handle) = segments.get(&segment_id) {
            return Ok(handle.clone());
        }

        let path = self.segment_path(segment_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        let handle = Arc::new(SegmentHandle {
            inner: RwLock::new(SegmentFile { file, size }),
        });
        segments.insert(segment_id, handle.clone());
        Ok(handle)
    }

    /// Grows the segment file to hold at least `min_size` zero-filled bytes.
    fn ensure_capacity(&self, handle: &SegmentHandle, min_size: u64) -> Result<()> {
        {
            let seg = handle.inner.read();
            if seg.size >= min_size {
                return Ok(());
            }
        }

        let mut seg = handle.inner.write();
        // Has it been resized in the meantime?
        if seg.size < min_size {
            seg.file.set_len(min_size)?;
            seg.size = min_size;
        }
        Ok(())
    }

    /// Reads one page from its segment file.
    ///
    /// A page that has never been written reads as zeroes; the file is
    /// grown to cover it first.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let handle = self.handle(page_id.segment_id)?;
        let offset = page_id.byte_offset();
        self.ensure_capacity(&handle, offset + PAGE_SIZE as u64)?;

        let seg = handle.inner.read();
        seg.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes one page to its segment file.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);

        let handle = self.handle(page_id.segment_id)?;
        let offset = page_id.byte_offset();
        self.ensure_capacity(&handle, offset + PAGE_SIZE as u64)?;

        let seg = handle.inner.read();
        seg.file.write_all_at(buf, offset)?;
        if self.config.fsync_enabled {
            seg.file.sync_data()?;
        }
        Ok(())
    }

    /// Returns the number of pages currently allocated in a segment file.
    pub fn page_count(&self, segment_id: u16) -> Result<u64> {
        let handle = self.handle(segment_id)?;
        let seg = handle.inner.read();
        Ok(seg.size / PAGE_SIZE as u64)
    }

    /// Flushes all open segment files.
    pub fn sync_all(&self) -> Result<()> {
        let segments = self.segments.read();
        for handle in segments.values() {
            let seg = handle.inner.read();
            seg.file.sync_all()?;
        }
        Ok(())
    }
}
