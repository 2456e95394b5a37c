//! Slotted-page segment: TID-addressed record operations.
//!
//! Records are opaque byte strings identified by a [`TupleId`]. The
//! originally addressed slot is a record's stable identity: growing a
//! record beyond its page turns that slot into a redirect pointing at a
//! relocated copy, so the TID handed out at allocation stays valid. Reads
//! and writes follow at most one redirect hop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferrite_buffer::{BufferManager, PageGuard};
use ferrite_common::{PageId, Result};

use crate::freespace::FsiSegment;
use crate::heap::page::{Slot, SlottedPage, SlottedPageRef, SLOT_SIZE};
use crate::schema::Table;
use crate::tuple::TupleId;

/// Record storage segment over slotted pages.
pub struct SpSegment {
    segment_id: u16,
    buffer: Arc<BufferManager>,
    fsi: Arc<FsiSegment>,
    table: Arc<Table>,
}

impl SpSegment {
    /// Creates the segment object for a table.
    pub fn new(buffer: Arc<BufferManager>, fsi: Arc<FsiSegment>, table: Arc<Table>) -> Self {
        Self {
            segment_id: table.sp_segment,
            buffer,
            fsi,
            table,
        }
    }

    /// Allocates space for a record of `size` bytes and returns its TID.
    pub fn allocate(&self, size: u32, is_redirect_target: bool) -> Result<TupleId> {
        let needed = size + SLOT_SIZE as u32;
        let candidate = self.fsi.find(needed);
        let (mut guard, mut page_index, created) = self.fix_allocation_target(candidate)?;

        if !created && SlottedPageRef::new(guard.data()).free_space() < needed {
            // The free cache was stale. Retry with a strictly larger
            // class; any page of that class is guaranteed to fit.
            self.buffer.unfix_page(guard, false);

            let next_class = self.fsi.encode_free_space(needed) + 1;
            let candidate = if next_class < 16 {
                self.fsi.find(self.fsi.decode_free_space(next_class))
            } else {
                None
            };
            let (retry_guard, retry_index, _) = self.fix_allocation_target(candidate)?;
            guard = retry_guard;
            page_index = retry_index;
        }

        let (slot_id, free_space) = {
            let mut page = SlottedPage::new(guard.data_mut());
            let slot_id = page.allocate(size, is_redirect_target);
            (slot_id, page.free_space())
        };
        self.buffer.unfix_page(guard, true);

        self.fsi.update(page_index, free_space)?;
        Ok(TupleId::new(page_index, slot_id))
    }

    /// Fixes the candidate page exclusively, or grows the table by a
    /// fresh slotted page when there is no candidate.
    fn fix_allocation_target(&self, candidate: Option<u64>) -> Result<(PageGuard, u64, bool)> {
        match candidate {
            Some(page_index) => {
                let guard = self
                    .buffer
                    .fix_page(PageId::new(self.segment_id, page_index), true)?;
                Ok((guard, page_index, false))
            }
            None => {
                let page_index = self.table.allocated_pages.fetch_add(1, Ordering::SeqCst);
                let mut guard = self
                    .buffer
                    .fix_page(PageId::new(self.segment_id, page_index), true)?;
                SlottedPage::init(guard.data_mut());
                Ok((guard, page_index, true))
            }
        }
    }

    /// Reads a record into `buf`, following at most one redirect hop.
    /// Returns the number of bytes copied.
    pub fn read(&self, tid: TupleId, buf: &mut [u8]) -> Result<usize> {
        let guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), false)?;
        let page = SlottedPageRef::new(guard.data());
        // A slot popped by a trailing erase reads as empty.
        if tid.slot_id() >= page.slot_count() {
            self.buffer.unfix_page(guard, false);
            return Ok(0);
        }
        let slot = page.slot(tid.slot_id());
        assert!(!slot.is_redirect_target(), "TID addresses a redirect target");

        if slot.is_empty() {
            self.buffer.unfix_page(guard, false);
            return Ok(0);
        }

        if slot.is_redirect() {
            let target = slot.redirect_target();
            self.buffer.unfix_page(guard, false);

            let rguard = self
                .buffer
                .fix_page(target.to_page_id(self.segment_id), false)?;
            let rslot = SlottedPageRef::new(rguard.data()).slot(target.slot_id());
            assert!(
                rslot.is_redirect_target() && !rslot.is_empty(),
                "redirect points at an invalid slot"
            );

            let n = buf.len().min(rslot.size() as usize);
            buf[..n].copy_from_slice(&rguard.data()[rslot.offset() as usize..][..n]);
            self.buffer.unfix_page(rguard, false);
            Ok(n)
        } else {
            let n = buf.len().min(slot.size() as usize);
            buf[..n].copy_from_slice(&guard.data()[slot.offset() as usize..][..n]);
            self.buffer.unfix_page(guard, false);
            Ok(n)
        }
    }

    /// Writes `buf` over a record without resizing it, following at most
    /// one redirect hop. Returns the number of bytes written.
    pub fn write(&self, tid: TupleId, buf: &[u8]) -> Result<usize> {
        let mut guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        let slot = SlottedPageRef::new(guard.data()).slot(tid.slot_id());

        if slot.is_redirect() {
            let target = slot.redirect_target();
            self.buffer.unfix_page(guard, false);

            let mut rguard = self
                .buffer
                .fix_page(target.to_page_id(self.segment_id), true)?;
            let rslot = SlottedPageRef::new(rguard.data()).slot(target.slot_id());
            assert!(rslot.is_redirect_target(), "redirect points at an invalid slot");

            let n = buf.len().min(rslot.size() as usize);
            rguard.data_mut()[rslot.offset() as usize..][..n].copy_from_slice(&buf[..n]);
            self.buffer.unfix_page(rguard, true);
            Ok(n)
        } else {
            let n = buf.len().min(slot.size() as usize);
            guard.data_mut()[slot.offset() as usize..][..n].copy_from_slice(&buf[..n]);
            self.buffer.unfix_page(guard, true);
            Ok(n)
        }
    }

    /// Resizes a record to `new_length` bytes, preserving the first
    /// `min(old, new)` bytes. The originally addressed slot keeps its TID;
    /// growth beyond its page is handled through redirect slots.
    pub fn resize(&self, tid: TupleId, new_length: u32) -> Result<()> {
        let guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        let slot = SlottedPageRef::new(guard.data()).slot(tid.slot_id());
        assert!(!slot.is_redirect_target(), "TID addresses a redirect target");

        if slot.is_redirect() {
            self.resize_redirected(tid, guard, slot.redirect_target(), new_length)
        } else {
            self.resize_inline(tid, guard, slot, new_length)
        }
    }

    /// Resize of a record that still lives on its original page.
    fn resize_inline(
        &self,
        tid: TupleId,
        mut guard: PageGuard,
        slot: Slot,
        new_length: u32,
    ) -> Result<()> {
        if slot.size() == new_length {
            self.buffer.unfix_page(guard, false);
            return Ok(());
        }

        let free_space = SlottedPageRef::new(guard.data()).free_space();
        if new_length < slot.size() || free_space >= new_length - slot.size() {
            // Still fits on this page; relocate compacts if needed.
            let free_after = {
                let mut page = SlottedPage::new(guard.data_mut());
                page.relocate(tid.slot_id(), new_length);
                page.free_space()
            };
            self.buffer.unfix_page(guard, true);
            self.fsi.update(tid.page_index(), free_after)?;
            return Ok(());
        }

        // Does not fit: move the record behind a redirect. The page is
        // released before allocating so the target search never runs into
        // the latch we hold; concurrent mutation of the same TID is the
        // caller's contract.
        let payload = SlottedPageRef::new(guard.data())
            .payload(tid.slot_id())
            .to_vec();
        self.buffer.unfix_page(guard, false);

        let target = self.allocate(new_length, true)?;
        self.write(target, &payload)?;

        let mut guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        let free_after = {
            let mut page = SlottedPage::new(guard.data_mut());
            page.make_redirect(tid.slot_id(), target);
            page.free_space()
        };
        self.buffer.unfix_page(guard, true);
        self.fsi.update(tid.page_index(), free_after)?;
        Ok(())
    }

    /// Resize of a record that already lives behind a redirect.
    fn resize_redirected(
        &self,
        tid: TupleId,
        guard: PageGuard,
        target: TupleId,
        new_length: u32,
    ) -> Result<()> {
        if target.page_index() == tid.page_index() {
            return self.resize_redirected_same_page(tid, guard, target, new_length);
        }

        let rguard = self
            .buffer
            .fix_page(target.to_page_id(self.segment_id), true)?;
        let rslot = SlottedPageRef::new(rguard.data()).slot(target.slot_id());
        assert!(rslot.is_redirect_target(), "redirect points at an invalid slot");
        let rfree = SlottedPageRef::new(rguard.data()).free_space();

        if new_length < rslot.size() || rfree >= new_length - rslot.size() {
            // Fits on the target's page.
            self.buffer.unfix_page(guard, false);

            let mut rguard = rguard;
            let free_after = {
                let mut page = SlottedPage::new(rguard.data_mut());
                page.relocate(target.slot_id(), new_length);
                page.free_space()
            };
            self.buffer.unfix_page(rguard, true);
            self.fsi.update(target.page_index(), free_after)?;
            return Ok(());
        }

        // Re-redirect: free the old target and move the record to a new
        // one, then repoint the original slot.
        let payload = SlottedPageRef::new(rguard.data())
            .payload(target.slot_id())
            .to_vec();
        let mut rguard = rguard;
        let rfree_after = {
            let mut page = SlottedPage::new(rguard.data_mut());
            page.erase(target.slot_id());
            page.free_space()
        };
        self.buffer.unfix_page(rguard, true);
        self.buffer.unfix_page(guard, false);
        self.fsi.update(target.page_index(), rfree_after)?;

        let new_target = self.allocate(new_length, true)?;
        self.write(new_target, &payload)?;

        let mut guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            page.repoint_redirect(tid.slot_id(), new_target);
        }
        self.buffer.unfix_page(guard, true);
        Ok(())
    }

    /// Redirect resize where the target happens to share the original
    /// slot's page: everything runs under the single latch already held.
    fn resize_redirected_same_page(
        &self,
        tid: TupleId,
        mut guard: PageGuard,
        target: TupleId,
        new_length: u32,
    ) -> Result<()> {
        let rslot = SlottedPageRef::new(guard.data()).slot(target.slot_id());
        assert!(rslot.is_redirect_target(), "redirect points at an invalid slot");
        let free_space = SlottedPageRef::new(guard.data()).free_space();

        if new_length < rslot.size() || free_space >= new_length - rslot.size() {
            let free_after = {
                let mut page = SlottedPage::new(guard.data_mut());
                page.relocate(target.slot_id(), new_length);
                page.free_space()
            };
            self.buffer.unfix_page(guard, true);
            self.fsi.update(tid.page_index(), free_after)?;
            return Ok(());
        }

        let payload = SlottedPageRef::new(guard.data())
            .payload(target.slot_id())
            .to_vec();
        let free_after = {
            let mut page = SlottedPage::new(guard.data_mut());
            page.erase(target.slot_id());
            page.free_space()
        };
        self.buffer.unfix_page(guard, true);
        self.fsi.update(tid.page_index(), free_after)?;

        let new_target = self.allocate(new_length, true)?;
        self.write(new_target, &payload)?;

        let mut guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        {
            let mut page = SlottedPage::new(guard.data_mut());
            page.repoint_redirect(tid.slot_id(), new_target);
        }
        self.buffer.unfix_page(guard, true);
        Ok(())
    }

    /// Erases a record, including its redirect target if it has one.
    pub fn erase(&self, tid: TupleId) -> Result<()> {
        let mut guard = self
            .buffer
            .fix_page(tid.to_page_id(self.segment_id), true)?;
        let slot = SlottedPageRef::new(guard.data()).slot(tid.slot_id());

        let free_after = {
            let mut page = SlottedPage::new(guard.data_mut());
            page.erase(tid.slot_id());
            page.free_space()
        };
        self.buffer.unfix_page(guard, true);

        if slot.is_redirect() {
            let target = slot.redirect_target();
            let mut rguard = self
                .buffer
                .fix_page(target.to_page_id(self.segment_id), true)?;
            let rslot = SlottedPageRef::new(rguard.data()).slot(target.slot_id());
            assert!(rslot.is_redirect_target(), "redirect points at an invalid slot");

            let rfree_after = {
                let mut page = SlottedPage::new(rguard.data_mut());
                page.erase(target.slot_id());
                page.free_space()
            };
            self.buffer.unfix_page(rguard, true);
            self.fsi.update(target.page_index(), rfree_after)?;
        }

        self.fsi.update(tid.page_index(), free_after)?;
        Ok(())
    }
}
