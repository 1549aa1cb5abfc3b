//! `VTSystem`: the public façade over `PhysicalSpace`, `VirtualTexture`,
//! `Scheduler`, and `AsyncLoader`.
//!
//! Virtual texture systems are often organized as a process-wide singleton
//! (a static instance returned from a `Get()`-style accessor). This crate
//! prefers an explicit constructed handle threaded through the renderer
//! instead; a caller free to wrap one `VTSystem` in a `once_cell`/
//! `OnceLock` if a singleton is genuinely wanted still gets idempotent
//! `init`/`shutdown` from this type itself.

use std::sync::{Arc, Weak};

use crate::clock::{FrameClock, MonotonicClock};
use crate::config::VtpeConfig;
use crate::loader::AsyncLoader;
use crate::log::{emit, FacadeLogSink, LogSink, Severity};
use crate::physical::PhysicalSpace;
use crate::scheduler::Scheduler;
use crate::virtual_texture::{PagePayloadLocator, VirtualTexture, VirtualTextureHandle};
use crate::{Result, VtpeError};

use sync::lock;

/// A snapshot of system-wide occupancy and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VTStats {
    pub num_virtual_textures: usize,
    pub num_physical_pages: usize,
    pub num_free_pages: usize,
    pub num_page_faults: u64,
    pub num_page_evictions: u64,
    pub total_page_requests: u64,
}

struct Initialized {
    config: VtpeConfig,
    physical: Arc<PhysicalSpace>,
    loader: Arc<AsyncLoader>,
    scheduler: Scheduler,
    textures: Vec<Weak<sync::Mutex<VirtualTexture>>>,
}

/// The engine's public entry point. Owns the `PhysicalSpace`, the
/// `AsyncLoader` pool, the `Scheduler`, and tracks (weakly) every
/// `VirtualTexture` handle it has vended, so that `stats()` can report
/// `num_virtual_textures` without keeping any of them alive itself —
/// ownership of a `VirtualTexture` lives with whoever holds its `Arc`.
pub struct VTSystem {
    log: Arc<dyn LogSink>,
    state: sync::Mutex<Option<Initialized>>,
}

impl VTSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::with_log_sink(Arc::new(FacadeLogSink))
    }

    #[must_use]
    pub fn with_log_sink(log: Arc<dyn LogSink>) -> Self {
        Self {
            log,
            state: sync::Mutex::new(None),
        }
    }

    /// Builds the `PhysicalSpace`, `AsyncLoader`, and `Scheduler` per
    /// `config`, spins up the loader's worker pool, and marks the system
    /// ready for use.
    ///
    /// Idempotent: calling `init` on an already-initialized system logs a
    /// `Warning` and returns `Ok(())` without disturbing the existing
    /// state (see [`VtpeError::DoubleInit`]).
    ///
    /// # Errors
    /// Returns [`VtpeError::InvalidArgument`] if `config`'s physical-space
    /// parameters are invalid (see
    /// [`PhysicalSpace::new`](crate::physical::PhysicalSpace::new)).
    pub fn init(&self, config: VtpeConfig) -> Result<()> {
        let mut state = lock(&self.state);
        if state.is_some() {
            emit!(self.log, "Core", Severity::Warning, "VTSystem::init called twice; ignoring");
            return Ok(());
        }

        let physical = Arc::new(PhysicalSpace::with_log_sink(
            config.physical_page_size,
            config.num_physical_pages,
            Arc::clone(&self.log),
        )?);
        let loader = Arc::new(AsyncLoader::with_log_sink(Arc::clone(&self.log)));
        loader.init(config.num_async_workers);
        let clock: Arc<dyn FrameClock> = Arc::new(MonotonicClock::new());
        let scheduler = Scheduler::with_log_sink(
            Arc::clone(&physical),
            Arc::clone(&loader),
            clock,
            config.max_requests_per_frame,
            Arc::clone(&self.log),
        );

        *state = Some(Initialized {
            config,
            physical,
            loader,
            scheduler,
            textures: Vec::new(),
        });
        Ok(())
    }

    /// Clears pending requests, drops every tracked `VirtualTexture`
    /// reference, shuts down the loader pool, and drops the
    /// `PhysicalSpace`. After this call `stats()`/other operations again
    /// report [`VtpeError::UninitializedUse`] until `init` runs again.
    pub fn shutdown(&self) {
        let Some(initialized) = lock(&self.state).take() else {
            return;
        };
        initialized.scheduler.shutdown();
        initialized.loader.shutdown();
        // `initialized.physical` and `.textures` drop here; any
        // `VirtualTexture` the caller still holds keeps its own strong
        // `Arc<PhysicalSpace>` alive until it too drops, at which point
        // its pages are freed (see `VirtualTexture`'s `Drop`).
    }

    /// Creates a new `VirtualTexture` of `w x h` pixels across `num_mips`
    /// mip levels, backed by this system's `PhysicalSpace`. The returned
    /// handle is the only strong reference the engine vends; `VTSystem`
    /// itself only tracks it weakly for stats purposes.
    ///
    /// # Errors
    /// Returns [`VtpeError::UninitializedUse`] before [`init`](Self::init).
    /// See [`VirtualTexture::new`] for other validation errors.
    pub fn create_virtual_texture(&self, w: u32, h: u32, num_mips: u32) -> Result<VirtualTextureHandle> {
        self.create_virtual_texture_with_locator(w, h, num_mips, None)
    }

    /// Like [`create_virtual_texture`](Self::create_virtual_texture), but
    /// attaching a [`PagePayloadLocator`] so the scheduler can issue real
    /// async loads for this texture's pages instead of only installing
    /// mappings.
    ///
    /// # Errors
    /// See [`create_virtual_texture`](Self::create_virtual_texture).
    pub fn create_virtual_texture_with_locator(
        &self,
        w: u32,
        h: u32,
        num_mips: u32,
        locator: Option<Arc<dyn PagePayloadLocator>>,
    ) -> Result<VirtualTextureHandle> {
        let mut state = lock(&self.state);
        let initialized = state.as_mut().ok_or(VtpeError::UninitializedUse)?;

        let mut vt = VirtualTexture::new(
            w,
            h,
            initialized.physical.tile_size(),
            num_mips,
            Arc::clone(&initialized.physical),
        )?;
        if let Some(locator) = locator {
            vt = vt.with_locator(locator);
        }
        let handle: VirtualTextureHandle = Arc::new(sync::Mutex::new(vt));
        initialized.textures.push(Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Requests that `(x, y, m)` of `vt` become resident, at an explicit
    /// priority rather than the mip-decayed default.
    ///
    /// # Errors
    /// See [`Scheduler::request`](crate::scheduler::Scheduler::request).
    /// Returns [`VtpeError::UninitializedUse`] before [`init`](Self::init).
    pub fn request_page(&self, vt: &VirtualTextureHandle, x: u32, y: u32, m: u32, priority: i32) -> Result<()> {
        let state = lock(&self.state);
        let initialized = state.as_ref().ok_or(VtpeError::UninitializedUse)?;
        initialized.scheduler.request(vt, x, y, m, Some(priority))
    }

    /// The render-side entry point: reports a sampled `(vt, x, y, m)`
    /// tuple at the default, mip-decayed priority.
    ///
    /// # Errors
    /// See [`request_page`](Self::request_page).
    pub fn record_access(&self, vt: &VirtualTextureHandle, x: u32, y: u32, m: u32) -> Result<()> {
        let state = lock(&self.state);
        let initialized = state.as_ref().ok_or(VtpeError::UninitializedUse)?;
        initialized.scheduler.record_access(vt, x, y, m)
    }

    /// Advances the engine by one frame: ticks the scheduler, which
    /// advances the frame counter, drains up to the configured per-frame
    /// cap of pending requests, and issues their async loads.
    ///
    /// # Errors
    /// Returns [`VtpeError::UninitializedUse`] before [`init`](Self::init).
    pub fn update(&self, delta_time: f32) -> Result<()> {
        let state = lock(&self.state);
        let initialized = state.as_ref().ok_or(VtpeError::UninitializedUse)?;
        initialized.scheduler.tick(delta_time);
        Ok(())
    }

    /// A snapshot of system-wide occupancy and counters.
    ///
    /// # Errors
    /// Returns [`VtpeError::UninitializedUse`] before [`init`](Self::init);
    /// [`VTStats`] implements `Default` for callers that want a zeroed
    /// fallback (`system.stats().unwrap_or_default()`) rather than
    /// propagating the error.
    pub fn stats(&self) -> Result<VTStats> {
        let mut state = lock(&self.state);
        let initialized = state.as_mut().ok_or(VtpeError::UninitializedUse)?;

        initialized.textures.retain(|w| w.strong_count() > 0);
        let scheduler_stats = initialized.scheduler.stats();

        Ok(VTStats {
            num_virtual_textures: initialized.textures.len(),
            num_physical_pages: initialized.config.num_physical_pages as usize,
            num_free_pages: scheduler_stats.num_free_pages,
            num_page_faults: scheduler_stats.page_faults,
            num_page_evictions: scheduler_stats.page_evictions,
            total_page_requests: scheduler_stats.total_requests,
        })
    }
}

impl Default for VTSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VtpeConfig {
        VtpeConfig::builder()
            .physical_page_size(128)
            .num_physical_pages(64)
            .num_async_workers(1)
            .build()
    }

    #[test]
    fn operations_before_init_are_uninitialized_errors() {
        let system = VTSystem::new();
        assert!(matches!(system.stats(), Err(VtpeError::UninitializedUse)));
        assert!(matches!(
            system.create_virtual_texture(1024, 1024, 4),
            Err(VtpeError::UninitializedUse)
        ));
    }

    #[test]
    fn double_init_is_a_warning_not_an_error() {
        let system = VTSystem::new();
        system.init(config()).unwrap();
        assert!(system.init(config()).is_ok());
        system.shutdown();
    }

    #[test]
    fn shutdown_frees_all_physical_pages() {
        let system = VTSystem::new();
        system.init(config()).unwrap();

        let vt = system.create_virtual_texture(4096, 4096, 1).unwrap();
        for i in 0..10u32 {
            system.record_access(&vt, i, 0, 0).unwrap();
        }
        system.update(0.0).unwrap();
        assert_eq!(system.stats().unwrap().num_free_pages, 54);

        drop(vt);
        assert_eq!(system.stats().unwrap().num_free_pages, 64);
        system.shutdown();
    }

    #[test]
    fn num_virtual_textures_reflects_live_handles() {
        let system = VTSystem::new();
        system.init(config()).unwrap();

        let vt = system.create_virtual_texture(1024, 1024, 1).unwrap();
        assert_eq!(system.stats().unwrap().num_virtual_textures, 1);

        drop(vt);
        assert_eq!(system.stats().unwrap().num_virtual_textures, 0);
        system.shutdown();
    }
}
