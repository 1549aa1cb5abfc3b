//! `Scheduler`: the per-frame request processor. Maintains a
//! priority-ordered queue of outstanding page faults, drains a bounded
//! number per tick, coordinates with `PhysicalSpace` for allocation/
//! eviction, and kicks off payload loads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use addr::VirtualPageAddress;

use crate::clock::FrameClock;
use crate::loader::{AsyncLoader, DestBuffer, ReadRequest};
use crate::log::{emit, FacadeLogSink, LogSink, Severity};
use crate::physical::PhysicalSpace;
use crate::virtual_texture::{VirtualTexture, VirtualTextureHandle};
use crate::{Result, VtpeError};

use sync::lock;

/// Higher numeric value wins. Coarse mips (visible over a larger screen
/// area) preempt fine mips by default — something is better than
/// nothing.
#[must_use]
pub fn default_priority(mip: u32) -> i32 {
    (100 - 10 * mip as i32).max(0)
}

/// An outstanding page fault, owned by the scheduler while enqueued.
///
/// Holds only a [`Weak`] reference to its texture: if the texture is
/// dropped while the request is still pending, the next `tick` purges it
/// instead of trying to upgrade a dead handle.
pub struct PageRequest {
    texture: Weak<sync::Mutex<VirtualTexture>>,
    x: u32,
    y: u32,
    mip: u32,
    priority: i32,
    seq: u64,
}

impl PageRequest {
    #[must_use]
    pub fn coords(&self) -> (u32, u32, u32) {
        (self.x, self.y, self.mip)
    }

    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }
}

/// A snapshot of the scheduler's counters plus `PhysicalSpace` occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub page_faults: u64,
    pub page_evictions: u64,
    pub total_requests: u64,
    pub pending_requests: usize,
    pub num_free_pages: usize,
    pub num_allocated_pages: usize,
}

struct Inner {
    pending: Vec<PageRequest>,
    next_seq: u64,
}

/// The per-frame request processor: a priority-ordered queue of
/// outstanding page faults drained by a bounded amount of work per tick.
///
/// Lock order, always: `Scheduler` → `PhysicalSpace` → `AsyncLoader`
/// queue. `tick` holds the scheduler's own lock for the duration of
/// processing.
pub struct Scheduler {
    physical: Arc<PhysicalSpace>,
    loader: Arc<AsyncLoader>,
    clock: Arc<dyn FrameClock>,
    inner: sync::Mutex<Inner>,
    page_faults: AtomicU64,
    page_evictions: AtomicU64,
    total_requests: AtomicU64,
    max_requests_per_frame: usize,
    log: Arc<dyn LogSink>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        physical: Arc<PhysicalSpace>,
        loader: Arc<AsyncLoader>,
        clock: Arc<dyn FrameClock>,
        max_requests_per_frame: usize,
    ) -> Self {
        Self::with_log_sink(physical, loader, clock, max_requests_per_frame, Arc::new(FacadeLogSink))
    }

    #[must_use]
    pub fn with_log_sink(
        physical: Arc<PhysicalSpace>,
        loader: Arc<AsyncLoader>,
        clock: Arc<dyn FrameClock>,
        max_requests_per_frame: usize,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            physical,
            loader,
            clock,
            inner: sync::Mutex::new(Inner {
                pending: Vec::new(),
                next_seq: 0,
            }),
            page_faults: AtomicU64::new(0),
            page_evictions: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            max_requests_per_frame,
            log,
        }
    }

    /// Validates coordinates; if the page is already resident, touches it
    /// and returns. Otherwise enqueues a [`PageRequest`] at `priority`
    /// (defaulting per [`default_priority`] when `priority_override` is
    /// `None`) and bumps the `page_faults`/`total_requests` counters.
    ///
    /// # Errors
    /// Returns [`VtpeError::InvalidArgument`] for an out-of-range mip or
    /// page coordinate, or for a coordinate that doesn't fit the packed
    /// virtual address encoding's 14-bit component width.
    pub fn request(
        &self,
        texture: &VirtualTextureHandle,
        x: u32,
        y: u32,
        mip: u32,
        priority_override: Option<i32>,
    ) -> Result<()> {
        // Reject coordinates that can't even be encoded into a
        // `VirtualPageAddress` before they ever reach the queue: a huge
        // virtual texture (the whole point of this engine) can have
        // `pages_x(mip)`/`pages_y(mip)` past the address format's 14-bit
        // coordinate width, and letting those through would only fail
        // later, silently, inside `try_satisfy`.
        if let Err(invalid) = VirtualPageAddress::try_encode(x, y, mip) {
            return Err(VtpeError::InvalidArgument(invalid.to_string()));
        }

        {
            let vt = lock(texture);
            if mip >= vt.num_mips() {
                return Err(VtpeError::InvalidArgument(format!(
                    "mip {mip} >= num_mips {}",
                    vt.num_mips()
                )));
            }
            if x >= vt.pages_x(mip) || y >= vt.pages_y(mip) {
                return Err(VtpeError::InvalidArgument(format!(
                    "page ({x}, {y}) out of range at mip {mip} ({}x{})",
                    vt.pages_x(mip),
                    vt.pages_y(mip)
                )));
            }
            if let Some(p) = vt.physical_index(x, y, mip) {
                drop(vt);
                self.physical.touch(p);
                return Ok(());
            }
        }

        let priority = priority_override.unwrap_or_else(|| default_priority(mip));
        let mut inner = lock(&self.inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push(PageRequest {
            texture: Arc::downgrade(texture),
            x,
            y,
            mip,
            priority,
            seq,
        });
        self.page_faults.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The render-side entry point: identical to
    /// [`request`](Self::request) with the default priority for `mip`.
    /// Kept as a distinct name for clarity at call sites and in stats,
    /// even though it's a thin wrapper.
    ///
    /// # Errors
    /// See [`request`](Self::request).
    pub fn record_access(&self, texture: &VirtualTextureHandle, x: u32, y: u32, mip: u32) -> Result<()> {
        self.request(texture, x, y, mip, None)
    }

    /// Called once per rendered frame.
    ///
    /// 1. Advances the frame counter on `PhysicalSpace`.
    /// 2. Sorts the pending queue by priority descending (stable: ties
    ///    preserve insertion order).
    /// 3. Processes up to `max_requests_per_frame` requests in order,
    ///    mapping each into a physical page and issuing its async load.
    ///    Stops at the first request that can't be mapped this tick
    ///    (`CapacityExhausted`), leaving it and everything behind it
    ///    enqueued for the next tick.
    ///
    /// `delta_time` is accepted to match the engine's per-frame update
    /// signature; amortization here is purely request-count based, not
    /// time based, so it isn't otherwise consulted.
    pub fn tick(&self, delta_time: f32) {
        let _ = delta_time;

        let frame = self.clock.advance();
        self.physical.advance_frame(frame);

        let mut inner = lock(&self.inner);
        inner
            .pending
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let mut processed = 0usize;
        let mut i = 0usize;
        while i < inner.pending.len() && processed < self.max_requests_per_frame {
            let Some(texture) = inner.pending[i].texture.upgrade() else {
                inner.pending.remove(i);
                continue;
            };

            let (x, y, mip) = inner.pending[i].coords();
            match self.try_satisfy(&texture, x, y, mip) {
                TickOutcome::Satisfied => {
                    inner.pending.remove(i);
                    processed += 1;
                }
                TickOutcome::AlreadyResident => {
                    inner.pending.remove(i);
                }
                TickOutcome::CapacityExhausted => break,
            }
        }
    }

    /// Attempts to allocate and populate a physical page for `(x, y,
    /// mip)` of `texture`. Installs the mapping in both `PhysicalSpace`
    /// and the texture's page table, then issues an async load (pinning
    /// the target page for the duration).
    fn try_satisfy(&self, texture: &VirtualTextureHandle, x: u32, y: u32, mip: u32) -> TickOutcome {
        if lock(texture).is_resident(x, y, mip) {
            return TickOutcome::AlreadyResident;
        }

        // `request` already rejects unencodable coordinates before they're
        // enqueued; this is a defense-in-depth fallback, not the primary
        // guard.
        let Ok(encoded) = VirtualPageAddress::try_encode(x, y, mip) else {
            emit!(
                self.log,
                "Scheduler",
                Severity::Error,
                "dropping request with unencodable address ({x}, {y}, mip {mip})"
            );
            return TickOutcome::AlreadyResident; // drop: programmer error, not a capacity issue
        };

        let Some(outcome) = self.physical.map_with_outcome(encoded, mip) else {
            return TickOutcome::CapacityExhausted;
        };

        if outcome.was_eviction() {
            self.page_evictions.fetch_add(1, Ordering::Relaxed);
        }

        let physical_index = outcome.index();
        lock(texture).install_mapping(x, y, mip, physical_index);
        self.issue_load(texture, x, y, mip, physical_index);

        TickOutcome::Satisfied
    }

    /// Pins `physical_index` and, if the texture has a payload locator
    /// configured, submits an async read of its payload. Without a
    /// locator the page stays mapped with whatever its buffer already
    /// held — the engine defines no on-disk container format of its own,
    /// so it has nothing to load without one.
    fn issue_load(&self, texture: &VirtualTextureHandle, x: u32, y: u32, mip: u32, physical_index: u32) {
        let Some((path, offset)): Option<(PathBuf, u64)> = lock(texture).locate_payload(x, y, mip) else {
            return;
        };

        self.physical.lock_page(physical_index);

        // SAFETY: the page is pinned above for the duration of the read;
        // PhysicalPage buffers never move or get reused while pinned.
        let Some(ptr) = (unsafe { self.physical.page_ptr(physical_index) }) else {
            self.physical.unlock_page(physical_index);
            return;
        };
        let len = self.physical.page_len();
        let dest = unsafe { DestBuffer::new(ptr, len) };

        let physical = Arc::clone(&self.physical);
        let log = Arc::clone(&self.log);
        let texture = Arc::clone(texture);
        let on_complete = move |success: bool, bytes_read: usize| {
            // Unlocks on every exit path, including a panicking callback
            // body — a logic error here must never leave a page
            // permanently pinned.
            let _unpin = scopeguard::guard((), |()| physical.unlock_page(physical_index));
            if !success {
                emit!(
                    log,
                    "Texture",
                    Severity::Warning,
                    "page load for physical index {physical_index} failed ({bytes_read} bytes read)"
                );
                // `free`, not a bare `unmap`: once the texture's page-table
                // entry is cleared below, this physical index is reachable
                // from nowhere else, so leaving it merely claimed-but-unmapped
                // would leak it from the budget permanently rather than
                // returning it to the free list for the next allocation to
                // reclaim.
                physical.free(physical_index);
                lock(&texture).clear_mapping(x, y, mip);
            }
        };

        let request = ReadRequest::builder()
            .file_path(path)
            .offset(offset)
            .size(len)
            .dest(dest)
            .on_complete(Box::new(on_complete))
            .build();
        self.loader.read_async(request);
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            page_evictions: self.page_evictions.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            pending_requests: lock(&self.inner).pending.len(),
            num_free_pages: self.physical.num_free(),
            num_allocated_pages: self.physical.num_allocated(),
        }
    }

    /// Clears every pending request. The scheduler holds no strong
    /// references to live textures or to `PhysicalSpace`/`AsyncLoader`
    /// beyond its own `Arc`s, so dropping those is the caller's
    /// responsibility once it drops the `Scheduler` itself.
    pub fn shutdown(&self) {
        lock(&self.inner).pending.clear();
    }
}

enum TickOutcome {
    Satisfied,
    AlreadyResident,
    CapacityExhausted,
}
