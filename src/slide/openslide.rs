//! OpenSlide-backed slides as an opaque region reader.
//!
//! OpenSlide is an external C library; the core treats it purely as a
//! pyramid-shaped pixel source behind this trait. A real binding implements
//! [`RegionReader`] over its `openslide_read_region`; tests use in-memory
//! fakes.

use async_trait::async_trait;

use crate::error::ImageError;

/// Narrow contract for an externally-decoded pyramid.
///
/// Coordinates for `read_region` are in the *requested level's* pixel space;
/// the output is packed BGRA, `w * h * 4` bytes.
#[async_trait]
pub trait RegionReader: Send + Sync {
    /// Number of pyramid levels the library exposes.
    fn level_count(&self) -> u32;

    /// Pixel dimensions of a level.
    fn level_dimensions(&self, level: u32) -> Option<(u32, u32)>;

    /// Downsample factor of a level relative to level 0.
    fn level_downsample(&self, level: u32) -> Option<f64>;

    /// Microns per pixel at level 0, when the library reports it.
    fn mpp(&self) -> Option<(f64, f64)>;

    /// Read a rectangular region at a level into BGRA pixels.
    async fn read_region(
        &self,
        level: u32,
        x: i64,
        y: i64,
        w: u32,
        h: u32,
    ) -> Result<Vec<u8>, ImageError>;
}
