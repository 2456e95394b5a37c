//! Slotted record pages.
//!
//! Page layout (little-endian):
//! ```text
//! +--------------------+
//! | PageHeader (12)    |
//! +--------------------+
//! | Slot Array         |  <- grows downward, 8 bytes per slot
//! +--------------------+
//! |                    |
//! | Free Space         |
//! |                    |
//! +--------------------+
//! | Record Data        |  <- grows upward from the end of the page
//! +--------------------+
//! ```
//!
//! A slot is one of:
//! - empty (value 0),
//! - inline (tag byte `0xFF`, redirect-target flag, 24-bit offset,
//!   24-bit size),
//! - redirect (tag byte `0xFE`, target tuple id in the low 56 bits).

use crate::tuple::TupleId;

/// Size of a slot entry in bytes.
pub const SLOT_SIZE: usize = 8;

/// Slot identifier within a page.
pub type SlotId = u16;

const TAG_SHIFT: u32 = 56;
const TAG_INLINE: u64 = 0xFF;
const TAG_REDIRECT: u64 = 0xFE;
const RT_FLAG_SHIFT: u32 = 48;
const OFFSET_SHIFT: u32 = 24;
const U24_MASK: u64 = 0x00FF_FFFF;
const TID_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Header structure at the beginning of every slotted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Number of slots in the slot array.
    pub slot_count: u16,
    /// Index of the lowest empty slot, or `slot_count` if none.
    pub first_free_slot: u16,
    /// Offset where the record data region begins.
    pub data_start: u32,
    /// Free bytes available after compaction.
    pub free_space: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 12;

    /// Header of a freshly formatted page.
    pub fn new(page_size: usize) -> Self {
        Self {
            slot_count: 0,
            first_free_slot: 0,
            data_start: page_size as u32,
            free_space: (page_size - Self::SIZE) as u32,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.first_free_slot.to_le_bytes());
        buf[4..8].copy_from_slice(&self.data_start.to_le_bytes());
        buf[8..12].copy_from_slice(&self.free_space.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            first_free_slot: u16::from_le_bytes([buf[2], buf[3]]),
            data_start: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            free_space: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// A slot in the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(u64);

impl Slot {
    /// The cleared slot.
    pub const EMPTY: Slot = Slot(0);

    /// Creates an inline slot pointing at record bytes on this page.
    pub fn inline(offset: u32, size: u32, is_redirect_target: bool) -> Self {
        debug_assert!(offset as u64 <= U24_MASK);
        debug_assert!(size as u64 <= U24_MASK);
        Slot(
            (TAG_INLINE << TAG_SHIFT)
                | ((is_redirect_target as u64) << RT_FLAG_SHIFT)
                | ((offset as u64) << OFFSET_SHIFT)
                | size as u64,
        )
    }

    /// Creates a redirect slot pointing at a record on another page.
    pub fn redirect(target: TupleId) -> Self {
        debug_assert!(target.raw() <= TID_MASK, "redirect target page index too large");
        Slot((TAG_REDIRECT << TAG_SHIFT) | target.raw())
    }

    fn tag(self) -> u64 {
        self.0 >> TAG_SHIFT
    }

    /// Returns true if this slot is cleared.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if this slot holds record bytes on this page.
    pub fn is_inline(self) -> bool {
        self.tag() == TAG_INLINE
    }

    /// Returns true if this slot redirects to another page.
    pub fn is_redirect(self) -> bool {
        self.tag() == TAG_REDIRECT
    }

    /// Returns true if this slot is the target of a redirect elsewhere.
    pub fn is_redirect_target(self) -> bool {
        self.is_inline() && (self.0 >> RT_FLAG_SHIFT) & 1 == 1
    }

    /// Returns the record offset; 0 for empty and redirect slots.
    pub fn offset(self) -> u32 {
        if self.is_inline() {
            ((self.0 >> OFFSET_SHIFT) & U24_MASK) as u32
        } else {
            0
        }
    }

    /// Returns the record size; 0 for empty and redirect slots.
    pub fn size(self) -> u32 {
        if self.is_inline() {
            (self.0 & U24_MASK) as u32
        } else {
            0
        }
    }

    /// Returns the redirect target of a redirect slot.
    pub fn redirect_target(self) -> TupleId {
        debug_assert!(self.is_redirect());
        TupleId::from_raw(self.0 & TID_MASK)
    }

    /// Returns the packed representation.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstructs a slot from its packed representation.
    pub fn from_u64(value: u64) -> Self {
        Slot(value)
    }
}

#[inline]
fn read_header(data: &[u8]) -> PageHeader {
    PageHeader::from_bytes(&data[..PageHeader::SIZE])
}

#[inline]
fn write_header(data: &mut [u8], header: &PageHeader) {
    data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
}

#[inline]
fn slot_offset(slot_id: SlotId) -> usize {
    PageHeader::SIZE + slot_id as usize * SLOT_SIZE
}

#[inline]
fn read_slot(data: &[u8], slot_id: SlotId) -> Slot {
    let off = slot_offset(slot_id);
    Slot::from_u64(u64::from_le_bytes(
        data[off..off + SLOT_SIZE].try_into().unwrap(),
    ))
}

#[inline]
fn write_slot(data: &mut [u8], slot_id: SlotId, slot: Slot) {
    let off = slot_offset(slot_id);
    data[off..off + SLOT_SIZE].copy_from_slice(&slot.as_u64().to_le_bytes());
}

/// Read-only view of a slotted page.
pub struct SlottedPageRef<'a> {
    data: &'a [u8],
}

impl<'a> SlottedPageRef<'a> {
    /// Wraps existing page bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the page header.
    pub fn header(&self) -> PageHeader {
        read_header(self.data)
    }

    /// Returns the number of slots.
    pub fn slot_count(&self) -> u16 {
        self.header().slot_count
    }

    /// Returns the free space after compaction.
    pub fn free_space(&self) -> u32 {
        self.header().free_space
    }

    /// Reads a slot. The slot id must be within the slot array.
    pub fn slot(&self, slot_id: SlotId) -> Slot {
        assert!(slot_id < self.header().slot_count, "slot id out of range");
        read_slot(self.data, slot_id)
    }

    /// Returns the record bytes of an inline slot.
    pub fn payload(&self, slot_id: SlotId) -> &'a [u8] {
        let slot = self.slot(slot_id);
        debug_assert!(slot.is_inline());
        &self.data[slot.offset() as usize..(slot.offset() + slot.size()) as usize]
    }
}

/// Mutable view of a slotted page.
pub struct SlottedPage<'a> {
    data: &'a mut [u8],
}

impl<'a> SlottedPage<'a> {
    /// Wraps existing page bytes.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Formats fresh page bytes as an empty slotted page.
    pub fn init(data: &mut [u8]) {
        let header = PageHeader::new(data.len());
        data[PageHeader::SIZE..].fill(0);
        write_header(data, &header);
    }

    /// Returns the page header.
    pub fn header(&self) -> PageHeader {
        read_header(self.data)
    }

    fn set_header(&mut self, header: &PageHeader) {
        write_header(self.data, header);
    }

    /// Returns the number of slots.
    pub fn slot_count(&self) -> u16 {
        self.header().slot_count
    }

    /// Returns the free space after compaction.
    pub fn free_space(&self) -> u32 {
        self.header().free_space
    }

    /// Returns the free bytes in the gap between slot array and data
    /// region, i.e. the largest allocation possible without compaction.
    pub fn fragmented_free_space(&self) -> u32 {
        let header = self.header();
        Self::fragmented_of(&header)
    }

    fn fragmented_of(header: &PageHeader) -> u32 {
        header.data_start
            - PageHeader::SIZE as u32
            - header.slot_count as u32 * SLOT_SIZE as u32
    }

    /// Reads a slot. The slot id must be within the slot array.
    pub fn slot(&self, slot_id: SlotId) -> Slot {
        assert!(slot_id < self.header().slot_count, "slot id out of range");
        read_slot(self.data, slot_id)
    }

    /// Returns the record bytes of an inline slot.
    pub fn payload(&self, slot_id: SlotId) -> &[u8] {
        let slot = self.slot(slot_id);
        debug_assert!(slot.is_inline());
        &self.data[slot.offset() as usize..(slot.offset() + slot.size()) as usize]
    }

    /// Returns the record bytes of an inline slot mutably.
    pub fn payload_mut(&mut self, slot_id: SlotId) -> &mut [u8] {
        let slot = self.slot(slot_id);
        debug_assert!(slot.is_inline());
        &mut self.data[slot.offset() as usize..(slot.offset() + slot.size()) as usize]
    }

    /// Allocates `size` bytes and returns the slot id.
    ///
    /// The caller must have checked `free_space` first; compaction runs
    /// when the contiguous gap alone is too small.
    pub fn allocate(&mut self, size: u32, is_redirect_target: bool) -> SlotId {
        let mut header = self.header();
        let reuse = header.first_free_slot < header.slot_count;
        let extra = if reuse { 0 } else { SLOT_SIZE as u32 };
        assert!(header.free_space >= size + extra, "slotted page out of space");

        if Self::fragmented_of(&header) <= size + extra {
            self.compactify();
            header = self.header();
        }

        let slot_id = if header.first_free_slot >= header.slot_count {
            let id = header.slot_count;
            header.slot_count += 1;
            header.free_space -= SLOT_SIZE as u32;
            id
        } else {
            header.first_free_slot
        };

        header.data_start -= size;
        header.free_space -= size;
        write_slot(
            self.data,
            slot_id,
            Slot::inline(header.data_start, size, is_redirect_target),
        );

        // Advance to the next empty slot.
        while header.first_free_slot < header.slot_count
            && !read_slot(self.data, header.first_free_slot).is_empty()
        {
            header.first_free_slot += 1;
        }

        self.set_header(&header);
        slot_id
    }

    /// Resizes an inline slot to `new_size` bytes, preserving the first
    /// `min(old, new)` bytes of its record.
    ///
    /// The caller must have checked that the page's `free_space` covers
    /// any growth.
    pub fn relocate(&mut self, slot_id: SlotId, new_size: u32) {
        let mut header = self.header();
        let slot = self.slot(slot_id);
        let old_size = slot.size();

        assert!(!slot.is_redirect() && !slot.is_empty());
        assert!(new_size <= old_size || header.free_space >= new_size - old_size);

        if new_size <= old_size {
            // Shrink in place.
            header.free_space += old_size - new_size;
            write_slot(
                self.data,
                slot_id,
                Slot::inline(slot.offset(), new_size, slot.is_redirect_target()),
            );
            self.set_header(&header);
        } else if Self::fragmented_of(&header) >= new_size {
            // Move into the gap.
            header.data_start -= new_size;
            header.free_space += old_size;
            header.free_space -= new_size;
            let new_offset = header.data_start;
            self.data.copy_within(
                slot.offset() as usize..(slot.offset() + old_size) as usize,
                new_offset as usize,
            );
            write_slot(
                self.data,
                slot_id,
                Slot::inline(new_offset, new_size, slot.is_redirect_target()),
            );
            self.set_header(&header);
        } else {
            // Grow the slot's stored size and let compaction make room.
            write_slot(
                self.data,
                slot_id,
                Slot::inline(slot.offset(), new_size, slot.is_redirect_target()),
            );
            self.compactify();
        }
    }

    /// Clears a slot and returns its bytes to the free space.
    pub fn erase(&mut self, slot_id: SlotId) {
        let mut header = self.header();
        let slot = self.slot(slot_id);

        header.free_space += slot.size();

        if slot_id < header.first_free_slot {
            header.first_free_slot = slot_id;
        }

        // If the record sits at the low end of the data region, reclaim it.
        if slot.is_inline() && slot.offset() == header.data_start {
            header.data_start += slot.size();
        }

        write_slot(self.data, slot_id, Slot::EMPTY);

        // Pop trailing empty slots.
        if slot_id + 1 == header.slot_count {
            while header.slot_count > 0
                && read_slot(self.data, header.slot_count - 1).is_empty()
            {
                header.slot_count -= 1;
                header.free_space += SLOT_SIZE as u32;
            }
        }

        self.set_header(&header);
    }

    /// Turns an inline slot into a redirect, releasing its bytes on this
    /// page. The record data stays where it is until the next compaction.
    pub fn make_redirect(&mut self, slot_id: SlotId, target: TupleId) {
        let mut header = self.header();
        let slot = self.slot(slot_id);
        debug_assert!(slot.is_inline() && !slot.is_redirect_target());

        header.free_space += slot.size();
        write_slot(self.data, slot_id, Slot::redirect(target));
        self.set_header(&header);
    }

    /// Repoints an existing redirect slot at a new target.
    pub fn repoint_redirect(&mut self, slot_id: SlotId, target: TupleId) {
        debug_assert!(self.slot(slot_id).is_redirect());
        write_slot(self.data, slot_id, Slot::redirect(target));
    }

    /// Rewrites the page so that all live record bytes are contiguous at
    /// the high-address end. Slot order and identity are preserved;
    /// redirect slots carry no data and are copied verbatim.
    pub fn compactify(&mut self) {
        let page_size = self.data.len();
        let header = self.header();
        let mut scratch = vec![0u8; page_size];
        let mut data_start = page_size as u32;

        for s in 0..header.slot_count {
            let slot = read_slot(self.data, s);
            let mut new_slot = slot;

            if slot.is_inline() {
                let size = slot.size();
                data_start -= size;
                // A slot grown past the old page content copies only the
                // bytes that exist; the rest of the new region stays zero.
                let avail = size.min(page_size as u32 - slot.offset());
                scratch[data_start as usize..(data_start + avail) as usize].copy_from_slice(
                    &self.data[slot.offset() as usize..(slot.offset() + avail) as usize],
                );
                new_slot = Slot::inline(data_start, size, slot.is_redirect_target());
            }

            write_slot(&mut scratch, s, new_slot);
        }

        let new_header = PageHeader {
            slot_count: header.slot_count,
            first_free_slot: header.first_free_slot,
            data_start,
            free_space: data_start
                - PageHeader::SIZE as u32
                - header.slot_count as u32 * SLOT_SIZE as u32,
        };
        write_header(&mut scratch, &new_header);

        self.data.copy_from_slice(&scratch);
    }
}
