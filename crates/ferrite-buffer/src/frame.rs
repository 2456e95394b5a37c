//! Buffer frame management.

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Mutex, RawRwLock};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use ferrite_common::{PageId, PAGE_SIZE};

/// Load state of a buffer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// No data buffer; the page must be loaded before use.
    NotLoaded = 0,
    /// A loader holds the loading latch and is reading the page in.
    Loading = 1,
    /// Resident, touched at most once: member of the FIFO list.
    InFifo = 2,
    /// Resident, touched repeatedly: member of the LRU list.
    InLru = 3,
}

impl PageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PageState::NotLoaded,
            1 => PageState::Loading,
            2 => PageState::InFifo,
            3 => PageState::InLru,
            _ => unreachable!("invalid page state {value}"),
        }
    }

    /// Returns true if the frame's data buffer is present and valid.
    pub fn is_loaded(&self) -> bool {
        matches!(self, PageState::InFifo | PageState::InLru)
    }
}

/// A frame in the buffer pool holding at most one page's bytes.
///
/// Frames are created lazily on first fix, keyed by page id in the page
/// table, and keep their identity for the buffer manager's lifetime. The
/// data buffer is allocated when the page is loaded and freed when it is
/// evicted.
///
/// Buffer access protocol: readers hold the page latch in any mode while
/// the state is loaded; writers hold it exclusively; the loader installs
/// the buffer under the loading latch before publishing `InFifo`; eviction
/// frees it while holding the page latch exclusively.
pub struct BufferFrame {
    /// The page this frame is keyed by.
    page_id: PageId,
    /// Load state, see [`PageState`].
    state: AtomicU8,
    /// Whether the page bytes differ from the on-disk state.
    dirty: AtomicBool,
    /// The page latch, held by fixers for the whole duration of a fix.
    latch: RawRwLock,
    /// Serializes loaders; waiters block here until the load finishes.
    loading: Mutex<()>,
    /// Page bytes, present only while the state is loaded.
    buf: UnsafeCell<Option<Box<[u8; PAGE_SIZE]>>>,
}

// Access to `buf` is governed by the latch protocol documented above.
unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

impl BufferFrame {
    /// Creates a new, not-loaded frame for the given page.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            state: AtomicU8::new(PageState::NotLoaded as u8),
            dirty: AtomicBool::new(false),
            latch: RawRwLock::INIT,
            loading: Mutex::new(()),
            buf: UnsafeCell::new(None),
        }
    }

    /// Returns the page id this frame belongs to.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the current load state.
    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sets the load state.
    #[inline]
    pub(crate) fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks or clears the dirty flag.
    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Acquires the page latch shared.
    #[inline]
    pub(crate) fn lock_shared(&self) {
        self.latch.lock_shared();
    }

    /// Acquires the page latch exclusively.
    #[inline]
    pub(crate) fn lock_exclusive(&self) {
        self.latch.lock_exclusive();
    }

    /// Tries to acquire the page latch exclusively without blocking.
    #[inline]
    pub(crate) fn try_lock_exclusive(&self) -> bool {
        self.latch.try_lock_exclusive()
    }

    /// Releases a shared page latch.
    ///
    /// # Safety
    /// The caller must hold the latch in shared mode.
    #[inline]
    pub(crate) unsafe fn unlock_shared(&self) {
        self.latch.unlock_shared();
    }

    /// Releases an exclusive page latch.
    ///
    /// # Safety
    /// The caller must hold the latch in exclusive mode.
    #[inline]
    pub(crate) unsafe fn unlock_exclusive(&self) {
        self.latch.unlock_exclusive();
    }

    /// Returns the loading latch.
    #[inline]
    pub(crate) fn loading_latch(&self) -> &Mutex<()> {
        &self.loading
    }

    /// Installs a freshly loaded data buffer.
    ///
    /// # Safety
    /// The caller must hold the loading latch and the state must not be
    /// loaded (no other thread reads the buffer before `InFifo` is
    /// published).
    pub(crate) unsafe fn install_buffer(&self, data: Box<[u8; PAGE_SIZE]>) {
        *self.buf.get() = Some(data);
    }

    /// Removes and returns the data buffer.
    ///
    /// # Safety
    /// The caller must hold the page latch exclusively.
    pub(crate) unsafe fn take_buffer(&self) -> Option<Box<[u8; PAGE_SIZE]>> {
        (*self.buf.get()).take()
    }

    /// Returns the page bytes.
    ///
    /// # Safety
    /// The caller must hold the page latch in some mode and the state must
    /// be loaded.
    #[inline]
    pub(crate) unsafe fn data_unchecked(&self) -> &[u8] {
        (*self.buf.get())
            .as_ref()
            .expect("buffer frame has no data")
            .as_ref()
    }

    /// Returns the page bytes mutably.
    ///
    /// # Safety
    /// The caller must hold the page latch exclusively and the state must
    /// be loaded.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_unchecked_mut(&self) -> &mut [u8] {
        (*self.buf.get())
            .as_mut()
            .expect("buffer frame has no data")
            .as_mut()
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("page_id", &self.page_id)
            .field("state", &self.state())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// RAII handle for a fixed page.
///
/// The guard holds the frame's page latch in the mode requested from
/// [`fix_page`](crate::BufferManager::fix_page) and releases it on drop.
/// Dropping the guard directly releases the page clean; use
/// [`unfix_page`](crate::BufferManager::unfix_page) to release it dirty.
pub struct PageGuard {
    frame: Arc<BufferFrame>,
    exclusive: bool,
}

impl PageGuard {
    /// Wraps a frame whose latch the caller has just acquired.
    pub(crate) fn new(frame: Arc<BufferFrame>, exclusive: bool) -> Self {
        Self { frame, exclusive }
    }

    /// Returns the page id of the fixed page.
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    /// Returns true if the latch is held exclusively.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn frame(&self) -> &Arc<BufferFrame> {
        &self.frame
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        assert!(
            self.frame.state().is_loaded(),
            "page {} accessed while not loaded",
            self.frame.page_id()
        );
        unsafe { self.frame.data_unchecked() }
    }

    /// Returns the page bytes mutably.
    ///
    /// Panics if the page was fixed shared.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(
            self.exclusive,
            "mutable access to page {} fixed in shared mode",
            self.frame.page_id()
        );
        assert!(
            self.frame.state().is_loaded(),
            "page {} accessed while not loaded",
            self.frame.page_id()
        );
        unsafe { self.frame.data_unchecked_mut() }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        unsafe {
            if self.exclusive {
                self.frame.unlock_exclusive();
            } else {
                self.frame.unlock_shared();
            }
        }
    }
}
