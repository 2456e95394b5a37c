//! Free-space inventory segment.
//!
//! The FSI tracks the approximate free space of every slotted page of a
//! table in a persistent bitmap: one 4-bit class per page, two pages per
//! byte (upper nibble for even page indexes). One FSI page covers
//! `2 * PAGE_SIZE` data pages.
//!
//! The 16 classes split into a logarithmic range (0..8, for pages less
//! than half free) and a linear range (8..16). On top of the bitmap sits
//! an in-memory cache holding, per class, the smallest known page index of
//! that class. The cache is optimistic: readers may observe stale entries
//! and must re-validate against the page's real free space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferrite_buffer::BufferManager;
use ferrite_common::{PageId, Result, INVALID_PAGE, PAGE_SIZE};

use crate::schema::Table;

/// Number of data pages covered by one FSI page.
const PAGES_PER_FSI_PAGE: u64 = 2 * PAGE_SIZE as u64;

/// Free-space inventory for one slotted-page segment.
pub struct FsiSegment {
    /// Segment id of the FSI pages.
    segment_id: u16,
    /// Bytes per linear class step.
    linear_factor: u32,
    /// Exponent scale of the logarithmic classes.
    log_factor: f32,
    /// Per-class smallest known page index, `INVALID_PAGE` when unknown.
    free_cache: [AtomicU64; 16],
    buffer: Arc<BufferManager>,
    table: Arc<Table>,
}

impl FsiSegment {
    /// Creates the inventory for a table and bootstraps the free cache by
    /// scanning the bitmap of all allocated pages.
    pub fn new(buffer: Arc<BufferManager>, table: Arc<Table>) -> Result<Self> {
        let fsi = Self {
            segment_id: table.fsi_segment,
            linear_factor: (PAGE_SIZE / 16 + 1) as u32,
            log_factor: (PAGE_SIZE as f32).log2() / 8.0,
            free_cache: std::array::from_fn(|_| AtomicU64::new(INVALID_PAGE)),
            buffer,
            table,
        };
        fsi.bootstrap_cache()?;
        Ok(fsi)
    }

    /// Quantizes a free-byte count into a 4-bit class.
    ///
    /// The encoding is monotonic: a page of class `c` has at least
    /// `decode_free_space(c)` free bytes.
    pub fn encode_free_space(&self, free_space: u32) -> u8 {
        if free_space < PAGE_SIZE as u32 / 2 {
            if free_space == 0 {
                0
            } else {
                ((free_space as f32).log2() / self.log_factor).floor() as u8
            }
        } else {
            (free_space / self.linear_factor) as u8
        }
    }

    /// Returns the minimum free-byte count a page of this class has.
    pub fn decode_free_space(&self, class: u8) -> u32 {
        debug_assert!(class < 16);
        if class < 8 {
            if class == 0 {
                0
            } else {
                2f32.powf(class as f32 * self.log_factor).ceil() as u32
            }
        } else {
            class as u32 * self.linear_factor
        }
    }

    /// Returns the smallest cached page index whose class can hold
    /// `required_space` bytes, or None if no class has a known page.
    pub fn find(&self, required_space: u32) -> Option<u64> {
        let mut class = self.encode_free_space(required_space);
        while class < 16 {
            let entry = self.free_cache[class as usize].load(Ordering::Relaxed);
            if entry != INVALID_PAGE {
                return Some(entry);
            }
            class += 1;
        }
        None
    }

    /// Records the new free space of a data page in the bitmap and keeps
    /// the free cache consistent.
    pub fn update(&self, target_page: u64, free_space: u32) -> Result<()> {
        let class = self.encode_free_space(free_space);
        let fsi_page = target_page / PAGES_PER_FSI_PAGE;
        let offset = (target_page % PAGES_PER_FSI_PAGE) as usize;

        let mut guard = self
            .buffer
            .fix_page(PageId::new(self.segment_id, fsi_page), true)?;
        let data = guard.data_mut();
        let byte = data[offset / 2];
        data[offset / 2] = if offset % 2 == 0 {
            (byte & 0x0F) | (class << 4)
        } else {
            (byte & 0xF0) | class
        };
        self.buffer.unfix_page(guard, true);

        self.repair_cache(target_page, class)
    }

    /// Reads the class nibble of a data page from FSI page bytes.
    fn nibble(data: &[u8], page_index: u64) -> u8 {
        let offset = (page_index % PAGES_PER_FSI_PAGE) as usize;
        let byte = data[offset / 2];
        if offset % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    /// Scans the bitmap in page order and seeds the free cache with the
    /// first page of each class.
    fn bootstrap_cache(&self) -> Result<()> {
        let allocated = self.table.allocated_pages.load(Ordering::Relaxed);
        let mut page_index = 0;

        while page_index < allocated {
            let fsi_page = page_index / PAGES_PER_FSI_PAGE;
            let guard = self
                .buffer
                .fix_page(PageId::new(self.segment_id, fsi_page), false)?;
            let data = guard.data();

            while page_index < allocated && page_index / PAGES_PER_FSI_PAGE == fsi_page {
                let class = Self::nibble(data, page_index) as usize;
                if self.free_cache[class].load(Ordering::Relaxed) == INVALID_PAGE {
                    self.free_cache[class].store(page_index, Ordering::Relaxed);
                }
                page_index += 1;
            }

            self.buffer.unfix_page(guard, false);
        }
        Ok(())
    }

    /// Re-establishes the cache invariant after `page_index` changed to
    /// `class`: the page becomes its new class's representative if it is
    /// the smallest, and if it was the representative of another class,
    /// the next page of that class takes over.
    fn repair_cache(&self, page_index: u64, class: u8) -> Result<()> {
        let mut vacated: Option<u8> = None;
        for c in 0..16u8 {
            if self.free_cache[c as usize].load(Ordering::Relaxed) == page_index {
                if c != class {
                    vacated = Some(c);
                }
                break;
            }
        }

        // INVALID_PAGE is u64::MAX, so min covers both "unset" and
        // "smaller index" in one step.
        self.free_cache[class as usize].fetch_min(page_index, Ordering::Relaxed);

        let Some(prev) = vacated else {
            return Ok(());
        };

        // The vacated entry was the earliest page of its class, so the
        // next representative can only sit at a higher index.
        let allocated = self.table.allocated_pages.load(Ordering::Relaxed);
        let mut cur = page_index + 1;
        while cur < allocated {
            let fsi_page = cur / PAGES_PER_FSI_PAGE;
            let guard = self
                .buffer
                .fix_page(PageId::new(self.segment_id, fsi_page), false)?;
            let data = guard.data();

            while cur < allocated && cur / PAGES_PER_FSI_PAGE == fsi_page {
                if Self::nibble(data, cur) == prev {
                    self.free_cache[prev as usize].store(cur, Ordering::Relaxed);
                    self.buffer.unfix_page(guard, false);
                    return Ok(());
                }
                cur += 1;
            }

            self.buffer.unfix_page(guard, false);
        }

        // No other page of that class exists.
        self.free_cache[prev as usize].store(INVALID_PAGE, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::BufferManagerConfig;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn create_test_fsi(allocated_pages: u64) -> (Arc<FsiSegment>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(
            BufferManager::new(BufferManagerConfig {
                data_dir: dir.path().to_path_buf(),
                page_count: 16,
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let table = Arc::new(Table::new("t", 1, 2));
        table.allocated_pages.store(allocated_pages, Ordering::Relaxed);
        let fsi = Arc::new(FsiSegment::new(buffer, table).unwrap());
        (fsi, dir)
    }

    #[test]
    fn test_encode_zero_and_full() {
        let (fsi, _dir) = create_test_fsi(0);

        assert_eq!(fsi.encode_free_space(0), 0);
        assert_eq!(fsi.decode_free_space(0), 0);

        let full = (PAGE_SIZE - 12) as u32;
        let class = fsi.encode_free_space(full);
        assert_eq!(class, 15);
    }

    #[test]
    fn test_encode_is_monotonic() {
        let (fsi, _dir) = create_test_fsi(0);

        let mut prev = 0u8;
        for free in 0..=(PAGE_SIZE as u32) {
            let class = fsi.encode_free_space(free);
            assert!(class < 16);
            assert!(class >= prev, "encode not monotonic at {free}");
            prev = class;
        }
    }

    #[test]
    fn test_pages_of_a_class_have_at_least_decoded_space() {
        let (fsi, _dir) = create_test_fsi(0);

        for free in 0..=(PAGE_SIZE as u32) {
            let class = fsi.encode_free_space(free);
            assert!(
                fsi.decode_free_space(class) <= free,
                "decode({class}) exceeds actual free {free}"
            );
        }
    }

    #[test]
    fn test_next_class_covers_request() {
        let (fsi, _dir) = create_test_fsi(0);

        // The allocator's retry step relies on: any page of class
        // encode(x)+1 or higher can hold x bytes.
        for free in 0..=(PAGE_SIZE as u32) {
            let next = fsi.encode_free_space(free) + 1;
            if next < 16 {
                assert!(
                    fsi.decode_free_space(next) >= free,
                    "decode({next}) cannot hold {free}"
                );
            }
        }
    }

    #[test]
    fn test_encode_decode_fixpoint() {
        let (fsi, _dir) = create_test_fsi(0);

        for class in 0..16u8 {
            assert_eq!(fsi.encode_free_space(fsi.decode_free_space(class)), class);
        }
    }

    #[test]
    fn test_update_and_find() {
        let (fsi, _dir) = create_test_fsi(4);

        fsi.update(0, fsi.decode_free_space(3)).unwrap();
        fsi.update(1, fsi.decode_free_space(9)).unwrap();
        fsi.update(2, fsi.decode_free_space(9)).unwrap();
        fsi.update(3, 0).unwrap();

        // Class 3 request served by page 0.
        assert_eq!(fsi.find(fsi.decode_free_space(3)), Some(0));
        // Larger request skips to the first class-9 page.
        assert_eq!(fsi.find(fsi.decode_free_space(5)), Some(1));
        // Nothing can hold class 12.
        assert_eq!(fsi.find(fsi.decode_free_space(12)), None);
    }

    #[test]
    fn test_vacated_class_finds_next_representative() {
        let (fsi, _dir) = create_test_fsi(40);

        // Pages 0..40 cycle through classes 0..16; page 5 and page 21
        // share class 5.
        for page in 0..40u64 {
            let class = (page % 16) as u8;
            fsi.update(page, fsi.decode_free_space(class)).unwrap();
        }
        assert_eq!(fsi.find(fsi.decode_free_space(5)), Some(5));

        // Page 5 drops to class 0: page 21 takes over as representative.
        fsi.update(5, 0).unwrap();
        assert_eq!(fsi.find(fsi.decode_free_space(5)), Some(21));
    }

    #[test]
    fn test_vacated_class_with_no_successor_invalidates() {
        let (fsi, _dir) = create_test_fsi(3);

        fsi.update(0, fsi.decode_free_space(14)).unwrap();
        fsi.update(1, fsi.decode_free_space(2)).unwrap();
        fsi.update(2, fsi.decode_free_space(2)).unwrap();

        // Page 0 was the only class-14 page; nothing can replace it.
        fsi.update(0, 0).unwrap();
        assert_eq!(fsi.find(fsi.decode_free_space(14)), None);
        // But it is now the class-0 representative.
        assert_eq!(fsi.free_cache[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bootstrap_rebuilds_cache() {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(
            BufferManager::new(BufferManagerConfig {
                data_dir: dir.path().to_path_buf(),
                page_count: 16,
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let table = Arc::new(Table::new("t", 1, 2));
        table.allocated_pages.store(10, Ordering::Relaxed);

        {
            let fsi = FsiSegment::new(buffer.clone(), table.clone()).unwrap();
            for page in 0..10u64 {
                let class = if page < 5 { 4u8 } else { 11u8 };
                fsi.update(page, fsi.decode_free_space(class)).unwrap();
            }
        }

        // A fresh inventory over the same bitmap sees the same earliest
        // representatives.
        let fsi = FsiSegment::new(buffer, table).unwrap();
        assert_eq!(fsi.find(fsi.decode_free_space(4)), Some(0));
        assert_eq!(fsi.find(fsi.decode_free_space(11)), Some(5));
    }
}
