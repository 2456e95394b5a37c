//! Minimal catalog surface consumed by the storage engine.
//!
//! The full catalog (columns, types, keys) lives outside this crate; the
//! segments only need to know which segment ids a table occupies and how
//! many slotted pages it has allocated.

use std::sync::atomic::AtomicU64;

/// Catalog entry for a table's storage segments.
pub struct Table {
    /// Name of the table.
    pub name: String,
    /// Segment id of the slotted pages.
    pub sp_segment: u16,
    /// Segment id of the free-space inventory.
    pub fsi_segment: u16,
    /// Number of allocated slotted pages.
    pub allocated_pages: AtomicU64,
}

impl Table {
    /// Creates a new table entry with no allocated pages.
    pub fn new(name: impl Into<String>, sp_segment: u16, fsi_segment: u16) -> Self {
        Self {
            name: name.into(),
            sp_segment,
            fsi_segment,
            allocated_pages: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_table_new() {
        let table = Table::new("orders", 1, 2);
        assert_eq!(table.name, "orders");
        assert_eq!(table.sp_segment, 1);
        assert_eq!(table.fsi_segment, 2);
        assert_eq!(table.allocated_pages.load(Ordering::Relaxed), 0);
    }
}
