//! Slide abstraction layer.
//!
//! One [`Image`] owns one loaded slide regardless of its container format
//! and exposes the uniform region interface the streaming layer consumes:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Tile streamer                │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │                Image                    │
//! │  (dense pyramid + per-tile flags)       │
//! └────────────────────┬────────────────────┘
//!                      │
//!       ┌──────────┬───┴──────┬───────────┐
//!       ▼          ▼          ▼           ▼
//!   TIFF/JPEG  OpenSlide   iSyntax     simple
//!   decoder    (opaque)    IDWT        raster
//! ```

mod image;
mod openslide;
mod simple;

#[cfg(test)]
pub(crate) use openslide::test_support;

pub use image::{
    Image, LevelImage, PixelFormat, SharedSource, Tile, MAX_LEVEL_COUNT,
};
pub use openslide::RegionReader;
pub use simple::{SimpleImage, SIMPLE_TILE_SIZE};
