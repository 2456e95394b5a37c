//! Storage engine for FerriteDB.
//!
//! This crate provides:
//! - Slotted record pages with in-page compaction and redirect slots
//! - A free-space inventory segment with a 16-class free-page cache
//! - The slotted-page segment exposing TID-addressed record operations
//! - A disk-resident B+tree index with latch-coupled concurrent access

mod btree;
mod freespace;
mod heap;
mod schema;
mod tuple;

pub use btree::{BTree, Datum, InnerNode, InnerNodeRef, LeafNode, LeafNodeRef, NodeHeader};
pub use freespace::FsiSegment;
pub use heap::{SlottedPage, SlottedPageRef, Slot, SlotId, SpSegment, PageHeader, SLOT_SIZE};
pub use schema::Table;
pub use tuple::TupleId;
