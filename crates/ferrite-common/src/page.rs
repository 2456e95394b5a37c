//! Page identifiers for FerriteDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
///
/// This is a compile-time constant; all segment files sharing a data
/// directory must have been written with the same value.
pub const PAGE_SIZE: usize = 4 * 1024;

/// Sentinel page index meaning "no page".
pub const INVALID_PAGE: u64 = u64::MAX;

/// Number of bits used for the page index within a segment.
const PAGE_INDEX_BITS: u32 = 48;

/// Mask covering the page-index bits of a packed page id.
const PAGE_INDEX_MASK: u64 = (1 << PAGE_INDEX_BITS) - 1;

/// Unique identifier for a page.
///
/// A PageId packs a 16-bit segment id and a 48-bit page index within that
/// segment into a single 64-bit value. The packed form is the only handle
/// that crosses component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Segment identifier.
    pub segment_id: u16,
    /// Page index within the segment (0-indexed, 48 bits).
    pub page_index: u64,
}

impl PageId {
    /// Creates a new PageId.
    ///
    /// The page index must fit in 48 bits.
    pub fn new(segment_id: u16, page_index: u64) -> Self {
        debug_assert!(page_index <= PAGE_INDEX_MASK);
        Self {
            segment_id,
            page_index,
        }
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.segment_id as u64) << PAGE_INDEX_BITS) | self.page_index
    }

    /// Creates a PageId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            segment_id: (value >> PAGE_INDEX_BITS) as u16,
            page_index: value & PAGE_INDEX_MASK,
        }
    }

    /// Returns the byte offset of this page within its segment file.
    pub fn byte_offset(&self) -> u64 {
        self.page_index * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.page_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4 * 1024);
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_page_id_new() {
        let page_id = PageId::new(1, 100);
        assert_eq!(page_id.segment_id, 1);
        assert_eq!(page_id.page_index, 100);
    }

    #[test]
    fn test_page_id_roundtrip() {
        let page_id = PageId::new(42, 1000);
        let as_u64 = page_id.as_u64();
        let recovered = PageId::from_u64(as_u64);
        assert_eq!(page_id, recovered);
    }

    #[test]
    fn test_page_id_roundtrip_edge_cases() {
        // Zero values
        let page_id = PageId::new(0, 0);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));

        // Max values
        let page_id = PageId::new(u16::MAX, (1 << 48) - 1);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));

        // Mixed values
        let page_id = PageId::new(0, (1 << 48) - 1);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));

        let page_id = PageId::new(u16::MAX, 0);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
    }

    #[test]
    fn test_page_id_as_u64_bit_layout() {
        let page_id = PageId::new(1, 2);
        let as_u64 = page_id.as_u64();
        // segment_id (1) in upper 16 bits, page_index (2) in lower 48 bits
        assert_eq!(as_u64, (1u64 << 48) | 2);
    }

    #[test]
    fn test_page_id_byte_offset() {
        assert_eq!(PageId::new(0, 0).byte_offset(), 0);
        assert_eq!(PageId::new(0, 3).byte_offset(), 3 * PAGE_SIZE as u64);
        // The segment id does not contribute to the file offset.
        assert_eq!(PageId::new(7, 3).byte_offset(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_page_id_display() {
        let page_id = PageId::new(5, 123);
        assert_eq!(page_id.to_string(), "5:123");

        let page_id = PageId::new(0, 0);
        assert_eq!(page_id.to_string(), "0:0");
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new(1, 1));
        set.insert(PageId::new(1, 2));
        set.insert(PageId::new(1, 1)); // Duplicate

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(10, 500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
