//! Engine-wide tunables, grouped into a single builder-constructed struct
//! rather than a long positional constructor, the same shape used
//! elsewhere in this crate for other multi-field, mostly-defaulted
//! descriptors.

use typed_builder::TypedBuilder;

/// Default cap on page requests satisfied per [`Scheduler::tick`]
/// (§4.3); bounds per-frame work so a burst of faults can't spike frame
/// time.
///
/// [`Scheduler::tick`]: crate::scheduler::Scheduler::tick
pub const DEFAULT_MAX_REQUESTS_PER_FRAME: usize = 32;

/// Default `AsyncLoader` worker thread count.
pub const DEFAULT_NUM_ASYNC_WORKERS: usize = 2;

/// Construction tunables for a [`VTSystem`](crate::system::VTSystem).
///
/// `physical_page_size` must be a power of two `>= 32`; `num_physical_pages`
/// must be at least 1. Both are validated by
/// [`PhysicalSpace::new`](crate::physical::PhysicalSpace::new), not here —
/// this struct only groups the values, it doesn't duplicate their
/// invariants.
#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct VtpeConfig {
    /// Pixels per side of a physical page tile.
    pub physical_page_size: u32,
    /// Number of resident physical pages the cache is budgeted for.
    pub num_physical_pages: u32,
    /// Maximum number of pending page requests satisfied per tick.
    #[builder(default = DEFAULT_MAX_REQUESTS_PER_FRAME)]
    pub max_requests_per_frame: usize,
    /// Worker thread count for the `AsyncLoader` pool.
    #[builder(default = DEFAULT_NUM_ASYNC_WORKERS)]
    pub num_async_workers: usize,
}
