//! `VirtualTexture`: a logical texture of arbitrary dimensions, partitioned
//! into tiles across a mip pyramid, with a dense per-mip page table
//! mapping virtual page coordinates to physical page indices.

use std::path::PathBuf;
use std::sync::Arc;

use crate::physical::PhysicalSpace;
use crate::{Result, VtpeError};

/// Locates the on-disk payload for one page of a [`VirtualTexture`].
///
/// The engine deliberately does not define a container format for page
/// payloads: it only needs, for a satisfied request, a `(file_path,
/// offset)` pair to hand `AsyncLoader` alongside
/// the page's own buffer length. Callers that do define a format
/// implement this trait and attach it via
/// [`VirtualTexture::with_locator`]; a texture with no locator attached
/// simply never issues a load (its pages are marked resident with
/// whatever the physical page buffer already held).
pub trait PagePayloadLocator: Send + Sync {
    /// Returns the `(file_path, byte_offset)` of page `(x, y, m)`'s
    /// payload, or `None` if this locator has nothing to say about it.
    fn locate(&self, x: u32, y: u32, m: u32) -> Option<(PathBuf, u64)>;
}

/// A shareable handle to a [`VirtualTexture`], held by both the render
/// thread and the scheduler. The inner mutex is the "small mutex inside
/// VirtualTexture" that guards page-table writes; the scheduler is the
/// only writer, but readers on other threads still go through it for a
/// consistent view.
pub type VirtualTextureHandle = Arc<sync::Mutex<VirtualTexture>>;

/// One entry of a mip level's page table.
#[derive(Debug, Clone, Copy, Default)]
struct PageTableEntry {
    physical_index: Option<u32>,
    resident: bool,
}

struct MipLevel {
    pages_x: u32,
    pages_y: u32,
    entries: Vec<PageTableEntry>,
}

impl MipLevel {
    fn new(pages_x: u32, pages_y: u32) -> Self {
        Self {
            pages_x,
            pages_y,
            entries: vec![PageTableEntry::default(); (pages_x * pages_y) as usize],
        }
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.pages_x || y >= self.pages_y {
            return None;
        }
        Some((y * self.pages_x + x) as usize)
    }
}

/// A logical texture partitioned into tile-sized pages across `num_mips`
/// mip levels, each with its own dense page table: mip level `m` has
/// exactly `pages_x(m) * pages_y(m)` entries, row-major (`idx = j *
/// pages_x(m) + i`).
///
/// Holds no physical pixel memory itself — only integer references into a
/// [`PhysicalSpace`] — so multiple virtual textures can share one
/// physical budget without holding cyclic references to each other.
pub struct VirtualTexture {
    virtual_width: u32,
    virtual_height: u32,
    tile_size: u32,
    num_mips: u32,
    mips: Vec<MipLevel>,
    physical: Arc<PhysicalSpace>,
    locator: Option<Arc<dyn PagePayloadLocator>>,
}

impl VirtualTexture {
    /// Builds the per-mip dense page tables, all entries non-resident.
    ///
    /// # Errors
    /// Returns [`VtpeError::InvalidArgument`] if `num_mips == 0` or if
    /// `tile_size == 0`.
    pub fn new(
        virtual_width: u32,
        virtual_height: u32,
        tile_size: u32,
        num_mips: u32,
        physical: Arc<PhysicalSpace>,
    ) -> Result<Self> {
        if num_mips == 0 {
            return Err(VtpeError::InvalidArgument(
                "num_mips must be at least 1".to_string(),
            ));
        }
        if tile_size == 0 {
            return Err(VtpeError::InvalidArgument(
                "tile_size must be non-zero".to_string(),
            ));
        }

        let mips = (0..num_mips)
            .map(|m| {
                let px = Self::pages_in_dim(virtual_width, tile_size, m);
                let py = Self::pages_in_dim(virtual_height, tile_size, m);
                MipLevel::new(px, py)
            })
            .collect();

        Ok(Self {
            virtual_width,
            virtual_height,
            tile_size,
            num_mips,
            mips,
            physical,
            locator: None,
        })
    }

    /// Attaches a payload locator, used by the scheduler to find the
    /// source bytes for a page it just mapped. Without one, satisfied
    /// requests install their mapping but issue no async load.
    #[must_use]
    pub fn with_locator(mut self, locator: Arc<dyn PagePayloadLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub(crate) fn locate_payload(&self, x: u32, y: u32, m: u32) -> Option<(PathBuf, u64)> {
        self.locator.as_ref()?.locate(x, y, m)
    }

    fn pages_in_dim(dim: u32, tile_size: u32, mip: u32) -> u32 {
        let mip_dim = (dim >> mip).max(1);
        mip_dim.div_ceil(tile_size).max(1)
    }

    #[must_use]
    pub const fn virtual_width(&self) -> u32 {
        self.virtual_width
    }

    #[must_use]
    pub const fn virtual_height(&self) -> u32 {
        self.virtual_height
    }

    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    #[must_use]
    pub const fn num_mips(&self) -> u32 {
        self.num_mips
    }

    /// `ceil((virtual_width >> m) / tile_size)`.
    #[must_use]
    pub fn pages_x(&self, m: u32) -> u32 {
        self.mips.get(m as usize).map_or(0, |mip| mip.pages_x)
    }

    /// `ceil((virtual_height >> m) / tile_size)`.
    #[must_use]
    pub fn pages_y(&self, m: u32) -> u32 {
        self.mips.get(m as usize).map_or(0, |mip| mip.pages_y)
    }

    /// Constant-time residency lookup; `false` for out-of-range
    /// coordinates.
    #[must_use]
    pub fn is_resident(&self, x: u32, y: u32, m: u32) -> bool {
        self.entry(x, y, m).is_some_and(|e| e.resident)
    }

    /// The mapped physical index, if resident.
    #[must_use]
    pub fn physical_index(&self, x: u32, y: u32, m: u32) -> Option<u32> {
        self.entry(x, y, m).filter(|e| e.resident)?.physical_index
    }

    fn entry(&self, x: u32, y: u32, m: u32) -> Option<&PageTableEntry> {
        let mip = self.mips.get(m as usize)?;
        let idx = mip.index(x, y)?;
        mip.entries.get(idx)
    }

    /// Installs a mapping for `(x, y, m)`, used by the scheduler when a
    /// page request is satisfied.
    ///
    /// Returns `false` if the coordinates are out of range for this
    /// texture.
    pub(crate) fn install_mapping(&mut self, x: u32, y: u32, m: u32, physical_index: u32) -> bool {
        let Some(mip) = self.mips.get_mut(m as usize) else {
            return false;
        };
        let Some(idx) = mip.index(x, y) else {
            return false;
        };
        mip.entries[idx] = PageTableEntry {
            physical_index: Some(physical_index),
            resident: true,
        };
        true
    }

    /// Purges the page table entry at `(x, y, m)`, e.g. after the physical
    /// page backing it was reclaimed out from under this texture.
    pub(crate) fn clear_mapping(&mut self, x: u32, y: u32, m: u32) {
        if let Some(mip) = self.mips.get_mut(m as usize) {
            if let Some(idx) = mip.index(x, y) {
                mip.entries[idx] = PageTableEntry::default();
            }
        }
    }

    /// Every `(x, y, m, physical_index)` currently marked resident.
    pub(crate) fn resident_pages(&self) -> impl Iterator<Item = (u32, u32, u32, u32)> + '_ {
        self.mips.iter().enumerate().flat_map(move |(m, mip)| {
            mip.entries.iter().enumerate().filter_map(move |(idx, e)| {
                if !e.resident {
                    return None;
                }
                let x = idx as u32 % mip.pages_x;
                let y = idx as u32 / mip.pages_x;
                Some((x, y, m as u32, e.physical_index?))
            })
        })
    }
}

impl Drop for VirtualTexture {
    /// Unmaps and frees every resident physical page so it returns to the
    /// free list; failing to do this would leak physical pages for as
    /// long as the underlying `PhysicalSpace` lives.
    fn drop(&mut self) {
        for (_, _, _, p) in self.resident_pages().collect::<Vec<_>>() {
            self.physical.unmap(p);
            self.physical.free(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::PhysicalSpace;

    fn texture(w: u32, h: u32, tile: u32, mips: u32) -> VirtualTexture {
        let physical = Arc::new(PhysicalSpace::new(tile, 64).unwrap());
        VirtualTexture::new(w, h, tile, mips, physical).unwrap()
    }

    #[test]
    fn pages_x_y_match_ceil_division() {
        let vt = texture(1000, 600, 128, 4);
        assert_eq!(vt.pages_x(0), 8); // ceil(1000/128) = 8
        assert_eq!(vt.pages_y(0), 5); // ceil(600/128) = 5
        assert_eq!(vt.pages_x(1), 4); // ceil(500/128) = 4
    }

    #[test]
    fn fresh_texture_has_no_resident_pages() {
        let vt = texture(1024, 1024, 128, 4);
        assert!(!vt.is_resident(0, 0, 0));
        assert_eq!(vt.physical_index(0, 0, 0), None);
    }

    #[test]
    fn is_resident_false_out_of_range() {
        let vt = texture(128, 128, 128, 1);
        assert!(!vt.is_resident(1000, 1000, 0));
        assert!(!vt.is_resident(0, 0, 5));
    }

    #[test]
    fn install_then_query_mapping() {
        let mut vt = texture(1024, 1024, 128, 4);
        assert!(vt.install_mapping(2, 3, 0, 7));
        assert!(vt.is_resident(2, 3, 0));
        assert_eq!(vt.physical_index(2, 3, 0), Some(7));
    }

    #[test]
    fn install_mapping_rejects_out_of_range() {
        let mut vt = texture(128, 128, 128, 1);
        assert!(!vt.install_mapping(1000, 0, 0, 0));
        assert!(!vt.install_mapping(0, 0, 9, 0));
    }

    #[test]
    fn drop_releases_physical_pages() {
        let physical = Arc::new(PhysicalSpace::new(128, 64).unwrap());
        {
            let mut vt =
                VirtualTexture::new(1024, 1024, 128, 1, Arc::clone(&physical)).unwrap();
            for i in 0..10 {
                let p = physical.allocate().unwrap();
                vt.install_mapping(i, 0, 0, p);
            }
            assert_eq!(physical.num_free(), 54);
        }
        assert_eq!(physical.num_free(), 64);
    }
}
