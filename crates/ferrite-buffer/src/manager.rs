//! Buffer manager with 2Q page replacement.
//!
//! Maps 64-bit page ids to in-memory frames, loading pages lazily from
//! their segment files and writing dirty pages back on eviction. The
//! replacement policy keeps two ordered lists: pages loaded but touched at
//! most once live in the FIFO list, pages touched at least twice in the
//! LRU list. Eviction scans FIFO first, then LRU, and takes the first
//! frame whose page latch can be acquired without waiting.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::System;

use ferrite_common::{BufferManagerConfig, DiskManagerConfig, FerriteError, PageId, Result, PAGE_SIZE};

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, PageGuard, PageState};

/// Buffer manager.
///
/// `fix_page` returns a [`PageGuard`] whose latch is held in the requested
/// mode and whose bytes reflect the current on-disk content or the last
/// written state. At most `page_count` pages are resident; when no victim
/// can be latched, fixing fails with [`FerriteError::BufferFull`].
pub struct BufferManager {
    /// Maximum number of resident pages.
    page_count: usize,
    /// Segment file I/O.
    disk: DiskManager,
    /// Page id to frame mapping. Frames are never removed; their identity
    /// is stable for the manager's lifetime.
    page_table: RwLock<HashMap<u64, Arc<BufferFrame>>>,
    /// Pages touched at most once, in load order.
    fifo: RwLock<Vec<Arc<BufferFrame>>>,
    /// Pages touched at least twice, least recently used first.
    lru: RwLock<Vec<Arc<BufferFrame>>>,
}

impl BufferManager {
    /// Creates a new buffer manager.
    pub fn new(config: BufferManagerConfig) -> Result<Self> {
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        })?;

        Ok(Self {
            page_count: config.page_count,
            disk,
            page_table: RwLock::new(HashMap::new()),
            fifo: RwLock::new(Vec::with_capacity(config.page_count)),
            lru: RwLock::new(Vec::with_capacity(config.page_count)),
        })
    }

    /// Creates a buffer manager sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so that caching stays useful on low-memory
    /// systems.
    pub fn auto_sized(data_dir: PathBuf) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let page_count = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferManagerConfig {
            data_dir,
            page_count,
            fsync_enabled: true,
        })
    }

    /// Returns the maximum number of resident pages.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Fixes a page, loading it from disk if necessary.
    ///
    /// The returned guard holds the page latch in the requested mode for
    /// its whole lifetime. Fails with [`FerriteError::BufferFull`] when the
    /// page is not resident and no victim can be evicted.
    pub fn fix_page(&self, page_id: PageId, exclusive: bool) -> Result<PageGuard> {
        let frame = self.frame_for(page_id);

        if exclusive {
            frame.lock_exclusive();
        } else {
            frame.lock_shared();
        }
        // The guard releases the latch again on every early return.
        let guard = PageGuard::new(frame.clone(), exclusive);

        match frame.state() {
            PageState::InFifo => self.promote_to_lru(&frame),
            PageState::InLru => {
                let mut lru = self.lru.write();
                Self::touch_lru(&mut lru, &frame);
            }
            PageState::NotLoaded => self.load_page(&frame)?,
            PageState::Loading => {
                // Wait for the loader, then re-evaluate.
                drop(frame.loading_latch().lock());
                if !frame.state().is_loaded() {
                    return Err(FerriteError::BufferFull);
                }
            }
        }

        Ok(guard)
    }

    /// Unfixes a page previously returned by [`fix_page`](Self::fix_page).
    ///
    /// When `is_dirty` is true the page is written back to disk
    /// eventually. Releasing a page fixed in shared mode as dirty is a
    /// caller bug.
    pub fn unfix_page(&self, guard: PageGuard, is_dirty: bool) {
        if is_dirty {
            debug_assert!(guard.is_exclusive(), "dirty unfix of a shared fix");
            guard.frame().set_dirty(true);
        }
        drop(guard);
    }

    /// Returns the page ids of all pages in the FIFO list, in FIFO order.
    pub fn get_fifo_list(&self) -> Vec<PageId> {
        self.fifo.read().iter().map(|f| f.page_id()).collect()
    }

    /// Returns the page ids of all pages in the LRU list, least recently
    /// used first.
    pub fn get_lru_list(&self) -> Vec<PageId> {
        self.lru.read().iter().map(|f| f.page_id()).collect()
    }

    /// Looks up or creates the frame for a page id.
    fn frame_for(&self, page_id: PageId) -> Arc<BufferFrame> {
        let key = page_id.as_u64();

        {
            let table = self.page_table.read();
            if let Some(frame) = table.get(&key) {
                return frame.clone();
            }
        }

        // Upgrade to exclusive; someone may have inserted in the meantime.
        let mut table = self.page_table.write();
        table
            .entry(key)
            .or_insert_with(|| Arc::new(BufferFrame::new(page_id)))
            .clone()
    }

    /// Loads the frame's page into memory.
    ///
    /// The caller holds the frame's page latch in some mode. The loading
    /// latch serializes loaders; latecomers observe the published state and
    /// return without touching the disk.
    fn load_page(&self, frame: &Arc<BufferFrame>) -> Result<()> {
        let _loading = frame.loading_latch().lock();

        match frame.state() {
            // Someone else loaded before us.
            PageState::InFifo | PageState::InLru => return Ok(()),
            PageState::Loading => {
                return Err(FerriteError::Internal(format!(
                    "page {} in loading state while loading latch is held",
                    frame.page_id()
                )))
            }
            PageState::NotLoaded => {}
        }

        frame.set_state(PageState::Loading);

        // Claim a slot in the FIFO list, evicting another frame if the
        // pool is full.
        match self.admit_frame(frame) {
            Ok(true) => {}
            Ok(false) => {
                frame.set_state(PageState::NotLoaded);
                return Err(FerriteError::BufferFull);
            }
            Err(e) => {
                // The victim flush failed after the slot was claimed.
                self.remove_from_fifo(frame);
                frame.set_state(PageState::NotLoaded);
                return Err(e);
            }
        }

        let mut data = Box::new([0u8; PAGE_SIZE]);
        if let Err(e) = self.disk.read_page(frame.page_id(), &mut data[..]) {
            self.remove_from_fifo(frame);
            frame.set_state(PageState::NotLoaded);
            return Err(e);
        }

        unsafe { frame.install_buffer(data) };
        frame.set_state(PageState::InFifo);
        Ok(())
    }

    /// Inserts the frame at the tail of the FIFO list, evicting a victim
    /// if the pool is full. Returns false when no victim could be latched.
    ///
    /// List latches are always taken in FIFO-then-LRU order.
    fn admit_frame(&self, frame: &Arc<BufferFrame>) -> Result<bool> {
        let mut fifo = self.fifo.write();

        {
            let lru = self.lru.read();
            if fifo.len() + lru.len() < self.page_count {
                fifo.push(frame.clone());
                return Ok(true);
            }
        }

        // Find a victim in the FIFO list.
        if let Some(pos) = Self::lock_evictable(&fifo) {
            let victim = fifo.remove(pos);
            debug_assert_eq!(victim.state(), PageState::InFifo);
            fifo.push(frame.clone());
            drop(fifo);

            return self.evict(victim).map(|_| true);
        }

        // Find a victim in the LRU list.
        let mut lru = self.lru.write();
        if let Some(pos) = Self::lock_evictable(&lru) {
            let victim = lru.remove(pos);
            debug_assert_eq!(victim.state(), PageState::InLru);
            drop(lru);
            fifo.push(frame.clone());
            drop(fifo);

            return self.evict(victim).map(|_| true);
        }

        Ok(false)
    }

    /// Returns the index of the first frame in the list whose page latch
    /// can be taken exclusively without waiting, leaving it latched.
    fn lock_evictable(list: &[Arc<BufferFrame>]) -> Option<usize> {
        list.iter().position(|frame| frame.try_lock_exclusive())
    }

    /// Flushes and unloads a victim frame whose page latch the caller has
    /// just acquired exclusively. Releases the latch before returning.
    fn evict(&self, victim: Arc<BufferFrame>) -> Result<()> {
        let flush_result = if victim.is_dirty() {
            self.flush_frame(&victim)
        } else {
            Ok(())
        };

        let buf = unsafe { victim.take_buffer() };
        debug_assert!(buf.is_some(), "evicting a frame without data");
        victim.set_state(PageState::NotLoaded);
        unsafe { victim.unlock_exclusive() };

        flush_result
    }

    /// Writes a frame's page to disk and clears the dirty flag.
    ///
    /// The caller must hold the frame's page latch.
    fn flush_frame(&self, frame: &BufferFrame) -> Result<()> {
        let data = unsafe { frame.data_unchecked() };
        self.disk.write_page(frame.page_id(), data)?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Moves a frame from the FIFO list to the tail of the LRU list.
    ///
    /// The caller holds the frame's page latch, so the frame cannot be
    /// evicted underneath us; a concurrent shared fixer may have promoted
    /// it already, which the state re-check catches.
    fn promote_to_lru(&self, frame: &Arc<BufferFrame>) {
        let mut fifo = self.fifo.write();
        let mut lru = self.lru.write();

        if frame.state() == PageState::InLru {
            Self::touch_lru(&mut lru, frame);
            return;
        }

        debug_assert_eq!(frame.state(), PageState::InFifo);
        let pos = fifo
            .iter()
            .position(|f| Arc::ptr_eq(f, frame))
            .expect("frame in FIFO state but missing from FIFO list");
        let frame = fifo.remove(pos);
        frame.set_state(PageState::InLru);
        lru.push(frame);
    }

    /// Moves a frame to the most-recently-used end of the LRU list.
    fn touch_lru(lru: &mut Vec<Arc<BufferFrame>>, frame: &Arc<BufferFrame>) {
        let pos = lru
            .iter()
            .position(|f| Arc::ptr_eq(f, frame))
            .expect("frame in LRU state but missing from LRU list");
        let frame = lru.remove(pos);
        lru.push(frame);
    }

    /// Removes a frame from the FIFO list after a failed load.
    fn remove_from_fifo(&self, frame: &Arc<BufferFrame>) {
        let mut fifo = self.fifo.write();
        if let Some(pos) = fifo.iter().position(|f| Arc::ptr_eq(f, frame)) {
            fifo.remove(pos);
        }
    }
}

impl Drop for BufferManager {
    /// Writes all dirty resident pages to disk and frees their buffers.
    ///
    /// Safe only when no other caller holds a fix, which `&mut self`
    /// guarantees.
    fn drop(&mut self) {
        let mut resident: Vec<Arc<BufferFrame>> = Vec::new();
        resident.append(self.fifo.get_mut());
        resident.append(self.lru.get_mut());

        for frame in resident {
            frame.lock_exclusive();
            debug_assert!(frame.state().is_loaded());

            if frame.is_dirty() {
                let _ = self.flush_frame(&frame);
            }

            unsafe {
                let _ = frame.take_buffer();
                frame.set_state(PageState::NotLoaded);
                frame.unlock_exclusive();
            }
        }
    }
}
