//! `PhysicalSpace`: the fixed-capacity array of resident pixel tiles and
//! the LRU eviction procedure that keeps it within budget.

use std::sync::Arc;

use addr::VirtualPageAddress;
use hashbrown::HashMap;

use crate::log::{emit, FacadeLogSink, LogSink, Severity};
use crate::{Result, VtpeError};

use sync::lock;
use utils::ByteSize;

/// Whether a physical page currently holds a mapping.
///
/// Derived, not stored: free iff `virtual_address` is unset AND the page
/// isn't pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    Resident,
}

/// How a [`PhysicalSpace::map_with_outcome`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// The address was already mapped; its existing index was touched
    /// and returned, no allocation occurred.
    Idempotent(u32),
    /// A page came straight off the free list.
    Allocated(u32),
    /// No free page was available; a resident page was evicted to make
    /// room.
    Evicted(u32),
}

impl MapOutcome {
    #[must_use]
    pub const fn index(self) -> u32 {
        match self {
            Self::Idempotent(p) | Self::Allocated(p) | Self::Evicted(p) => p,
        }
    }

    #[must_use]
    pub const fn was_eviction(self) -> bool {
        matches!(self, Self::Evicted(_))
    }
}

/// A single resident tile: its backing pixel storage plus the metadata
/// `PhysicalSpace` needs to decide whether it can be evicted.
pub struct PhysicalPage {
    pixels: Box<[u8]>,
    virtual_address: Option<VirtualPageAddress>,
    mip_level: u32,
    last_used_frame: u32,
    lock_count: u32,
}

impl PhysicalPage {
    fn new(tile_size: u32) -> Self {
        let len = tile_size as usize * tile_size as usize * 4;
        Self {
            pixels: vec![0u8; len].into_boxed_slice(),
            virtual_address: None,
            mip_level: 0,
            last_used_frame: 0,
            lock_count: 0,
        }
    }

    /// The state derived from this page's current mapping and pin count.
    #[must_use]
    pub fn state(&self) -> PageState {
        if self.virtual_address.is_none() && self.lock_count == 0 {
            PageState::Free
        } else {
            PageState::Resident
        }
    }

    #[must_use]
    pub fn virtual_address(&self) -> Option<VirtualPageAddress> {
        self.virtual_address
    }

    #[must_use]
    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    #[must_use]
    pub fn last_used_frame(&self) -> u32 {
        self.last_used_frame
    }

    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    fn is_evictable(&self) -> bool {
        self.virtual_address.is_some() && self.lock_count == 0
    }
}

struct Inner {
    pages: Vec<PhysicalPage>,
    free_list: Vec<u32>,
    reverse_map: HashMap<u32, u32>,
    current_frame: u32,
}

/// A fixed-capacity array of identically sized physical pages, demand
/// allocated via LRU eviction under a hard budget.
///
/// All mutable state (the page array, free list, reverse map, and frame
/// counter) is guarded by a single serializing lock: every mutating
/// operation, and `touch`, take it; `num_free`/
/// `num_allocated` take it too since they are snapshots rather than a
/// hot-path read.
pub struct PhysicalSpace {
    tile_size: u32,
    num_pages: u32,
    inner: sync::Mutex<Inner>,
    log: Arc<dyn LogSink>,
}


impl PhysicalSpace {
    /// Allocates `num_pages` page buffers of `tile_size^2 * 4` bytes each
    /// and pushes every index onto the free list.
    ///
    /// # Errors
    /// Returns [`VtpeError::InvalidArgument`] if `tile_size` is not a
    /// power of two `>= 32`, or if `num_pages == 0`.
    pub fn new(tile_size: u32, num_pages: u32) -> Result<Self> {
        Self::with_log_sink(tile_size, num_pages, Arc::new(FacadeLogSink))
    }

    /// Like [`new`](Self::new), but emitting diagnostics through a
    /// caller-supplied [`LogSink`] instead of the default facade bridge.
    ///
    /// # Errors
    /// See [`new`](Self::new).
    pub fn with_log_sink(tile_size: u32, num_pages: u32, log: Arc<dyn LogSink>) -> Result<Self> {
        if tile_size < 32 || !tile_size.is_power_of_two() {
            return Err(VtpeError::InvalidArgument(format!(
                "tile_size must be a power of two >= 32, got {tile_size}"
            )));
        }
        if num_pages == 0 {
            return Err(VtpeError::InvalidArgument(
                "num_pages must be at least 1".to_string(),
            ));
        }

        let pages = (0..num_pages).map(|_| PhysicalPage::new(tile_size)).collect();
        // Ascending so that `Vec::pop` (LIFO) hands out the highest index
        // first, matching the deterministic ordering the test suite (and
        // `free`'s push-most-recent-first policy) expects.
        let free_list = (0..num_pages).collect();

        let budget = ByteSize::new(num_pages as usize * tile_size as usize * tile_size as usize * 4);
        emit!(
            log,
            "Memory",
            Severity::Display,
            "physical space budgeted: {num_pages} pages of {tile_size}x{tile_size} ({budget})"
        );

        Ok(Self {
            tile_size,
            num_pages,
            inner: sync::Mutex::new(Inner {
                pages,
                free_list,
                reverse_map: HashMap::new(),
                current_frame: 0,
            }),
            log,
        })
    }

    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    #[must_use]
    pub const fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// The length in bytes of a single page's pixel buffer
    /// (`tile_size^2 * 4`).
    #[must_use]
    pub fn page_len(&self) -> usize {
        self.tile_size as usize * self.tile_size as usize * 4
    }

    /// Returns a free page index, evicting an LRU victim if the free list
    /// is empty. Returns `None` only when every resident page is pinned.
    pub fn allocate(&self) -> Option<u32> {
        let mut inner = lock(&self.inner);
        if let Some(p) = inner.free_list.pop() {
            return Some(p);
        }
        Self::evict_locked(&mut inner, &self.log)
    }

    /// Clears the page's virtual mapping (removing it from the reverse
    /// map if present), resets its lock count to zero, and pushes it onto
    /// the free list. A double-free is a no-op; freeing an out-of-range
    /// index fails silently with a logged error.
    pub fn free(&self, p: u32) {
        let mut inner = lock(&self.inner);
        let Some(page) = inner.pages.get_mut(p as usize) else {
            emit!(self.log, "Memory", Severity::Error, "free: physical page index {p} out of range");
            return;
        };

        if let Some(va) = page.virtual_address.take() {
            inner.reverse_map.remove(&va.raw());
        }

        let page = &mut inner.pages[p as usize];
        page.lock_count = 0;

        if inner.free_list.contains(&p) {
            return;
        }
        inner.free_list.push(p);
    }

    /// Idempotent remap: if `virtual_address` is already mapped, touches
    /// and returns its physical index without allocating. Otherwise
    /// allocates a page (evicting if necessary), installs the mapping,
    /// and returns its index. Returns `None` only if allocation does.
    pub fn map(&self, virtual_address: VirtualPageAddress, mip: u32) -> Option<u32> {
        self.map_with_outcome(virtual_address, mip)
            .map(MapOutcome::index)
    }

    /// Like [`map`](Self::map), but distinguishes whether the call found
    /// an existing mapping, took a page straight off the free list, or
    /// had to evict a resident page to make room. The scheduler uses this
    /// to maintain its `page_evictions` counter.
    pub fn map_with_outcome(&self, virtual_address: VirtualPageAddress, mip: u32) -> Option<MapOutcome> {
        // Held for the whole call (not released between the reverse-map
        // lookup and the allocation) so that two concurrent `map()` calls
        // for the same address can't both decide to allocate (spec's
        // idempotency guarantee).
        let mut inner = lock(&self.inner);

        if let Some(&p) = inner.reverse_map.get(&virtual_address.raw()) {
            let frame = inner.current_frame;
            inner.pages[p as usize].last_used_frame = frame;
            return Some(MapOutcome::Idempotent(p));
        }

        let (p, outcome): (u32, fn(u32) -> MapOutcome) = match inner.free_list.pop() {
            Some(p) => (p, MapOutcome::Allocated),
            None => (Self::evict_locked(&mut inner, &self.log)?, MapOutcome::Evicted),
        };

        let frame = inner.current_frame;
        let page = &mut inner.pages[p as usize];
        page.virtual_address = Some(virtual_address);
        page.mip_level = mip;
        page.last_used_frame = frame;
        inner.reverse_map.insert(virtual_address.raw(), p);
        Some(outcome(p))
    }

    /// Removes any reverse-map entry and clears the virtual mapping.
    /// Unlike [`free`](Self::free), does not return the page to the free
    /// list: the page stays claimed until an explicit `free` or a later
    /// `map` reclaims it.
    pub fn unmap(&self, p: u32) {
        let mut inner = lock(&self.inner);
        let Some(page) = inner.pages.get_mut(p as usize) else {
            emit!(self.log, "Memory", Severity::Error, "unmap: physical page index {p} out of range");
            return;
        };
        if let Some(va) = page.virtual_address.take() {
            inner.reverse_map.remove(&va.raw());
        }
    }

    /// Sets the page's `last_used_frame` to the current frame. No-op on
    /// an out-of-range index.
    pub fn touch(&self, p: u32) {
        let mut inner = lock(&self.inner);
        let frame = inner.current_frame;
        if let Some(page) = inner.pages.get_mut(p as usize) {
            page.last_used_frame = frame;
        }
    }

    /// Increments the page's lock (pin) count, preventing eviction while
    /// it is non-zero.
    pub fn lock_page(&self, p: u32) {
        let mut inner = lock(&self.inner);
        if let Some(page) = inner.pages.get_mut(p as usize) {
            page.lock_count += 1;
        } else {
            emit!(self.log, "Memory", Severity::Error, "lock: physical page index {p} out of range");
        }
    }

    /// Decrements the page's lock count. Unlocking a page whose lock
    /// count is already zero saturates at zero and logs an error.
    pub fn unlock_page(&self, p: u32) {
        let mut inner = lock(&self.inner);
        let Some(page) = inner.pages.get_mut(p as usize) else {
            emit!(self.log, "Memory", Severity::Error, "unlock: physical page index {p} out of range");
            return;
        };
        if let Some(next) = page.lock_count.checked_sub(1) {
            page.lock_count = next;
        } else {
            emit!(self.log, "Memory", Severity::Warning, "unlock: page {p} lock count already zero");
        }
    }

    /// Borrows a pointer to page `p`'s pixel buffer, `page_len()` bytes
    /// long.
    ///
    /// # Safety
    /// The returned pointer is only valid to dereference while page `p`
    /// remains pinned (`lock_count > 0`) or while the caller otherwise
    /// guarantees no other thread can evict or free it in the meantime.
    /// `PhysicalPage`'s backing storage never moves once allocated, so the
    /// pointer stays valid across unrelated `PhysicalSpace` operations as
    /// long as that pin holds.
    #[must_use]
    pub unsafe fn page_ptr(&self, p: u32) -> Option<*mut u8> {
        let inner = lock(&self.inner);
        inner.pages.get(p as usize).map(|page| page.pixels.as_ptr() as *mut u8)
    }

    #[must_use]
    pub fn num_free(&self) -> usize {
        lock(&self.inner).free_list.len()
    }

    #[must_use]
    pub fn num_allocated(&self) -> usize {
        self.num_pages as usize - self.num_free()
    }

    /// Sets the frame used by subsequent `touch`/`map` calls. Must be
    /// called exactly once per frame, from the scheduler.
    pub fn advance_frame(&self, frame: u32) {
        lock(&self.inner).current_frame = frame;
    }

    #[must_use]
    pub fn virtual_address_of(&self, p: u32) -> Option<VirtualPageAddress> {
        lock(&self.inner).pages.get(p as usize)?.virtual_address
    }

    #[must_use]
    pub fn last_used_frame_of(&self, p: u32) -> Option<u32> {
        Some(lock(&self.inner).pages.get(p as usize)?.last_used_frame)
    }

    #[must_use]
    pub fn lock_count_of(&self, p: u32) -> u32 {
        lock(&self.inner)
            .pages
            .get(p as usize)
            .map_or(0, PhysicalPage::lock_count)
    }

    #[must_use]
    pub fn state_of(&self, p: u32) -> Option<PageState> {
        Some(lock(&self.inner).pages.get(p as usize)?.state())
    }

    /// Scans the page array once for the resident, unpinned page with the
    /// smallest `last_used_frame`, ties broken by lowest index. If found,
    /// clears its mapping and hands its index back as if freshly free —
    /// it is not pushed onto the free list, the caller (`allocate`) owns
    /// it directly.
    ///
    /// O(N) by design: N is small (hundreds to low thousands) and this
    /// avoids maintaining a separate LRU structure under the space lock.
    fn evict_locked(inner: &mut Inner, log: &Arc<dyn LogSink>) -> Option<u32> {
        let victim = inner
            .pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.is_evictable())
            .min_by_key(|(idx, page)| (page.last_used_frame, *idx))
            .map(|(idx, _)| idx as u32)?;

        let page = &mut inner.pages[victim as usize];
        if let Some(va) = page.virtual_address.take() {
            inner.reverse_map.remove(&va.raw());
            emit!(log, "Memory", Severity::Verbose, "evicted page {victim} (virtual address {va})");
        }
        Some(victim)
    }
}
