//! # slide-core
//!
//! The tiled image access core of a whole-slide image (WSI) viewer.
//!
//! A WSI is a multi-gigapixel microscopy scan stored as a multi-resolution
//! pyramid. This library presents a uniform random-access interface over
//! three container families — any rectangle at any pyramid level
//! materialises as BGRA pixels, on demand, with bounded memory:
//!
//! - **TIFF / BigTIFF** pyramids of JPEG-compressed tiles, local or behind
//!   an HTTPS range endpoint (with serialised wire metadata)
//! - **iSyntax** wavelet containers, reconstructed through Hulsken
//!   decompression and an integer 5/3 inverse wavelet transform
//! - **OpenSlide**-backed pyramids, treated as an opaque region reader
//!
//! ## Architecture
//!
//! - [`io`] - byte sources (file, HTTPS ranges) and the segment cache
//! - [`mod@format`] - TIFF parsing, JPEG tile handling, the iSyntax engine
//! - [`slide`] - the `Image` dispatcher and pyramid/tile model
//! - [`tile`] - tile cache, priority work queue, worker pool, streamer
//! - [`config`] - CLI types for the wrapper binary
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slide_core::{FileSource, Image, PixelFormat};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(FileSource::open("slide.tiff")?);
//!     let image = Image::open(source).await?;
//!
//!     println!("{}x{} pixels, {} levels, mpp {:?}",
//!         image.dimensions().0, image.dimensions().1,
//!         image.level_count(), image.mpp());
//!
//!     let mut pixels = vec![0u8; 512 * 512 * 4];
//!     image.read_region(0, 5120, 2560, 512, 512, &mut pixels, PixelFormat::Bgra8).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, Command, InfoConfig, RegionConfig};
pub use error::{
    CodeblockError, ImageError, IoError, IsyntaxError, JpegError, TiffError, TileError,
};
pub use format::isyntax::{IsyntaxContainer, IsyntaxImage};
pub use format::tiff::{
    parse_metadata, serialize_metadata, serialize_metadata_compressed, ByteOrder, TiffHeader,
    TiffLevel, TiffSlide,
};
pub use format::{detect_format, is_tiff_header, SlideFormat};
pub use io::{ByteSource, FileSource, RemoteSource, SegmentCache};
pub use slide::{
    Image, LevelImage, PixelFormat, RegionReader, SharedSource, SimpleImage, Tile,
    MAX_LEVEL_COUNT,
};
pub use tile::{
    CacheLookup, CompletionKind, SceneSnapshot, TileCache, TileCacheKey, TileCompletion,
    TileStreamer, TileTask, ZoomState, COMPLETION_DRAIN_BUDGET, DEFAULT_TILE_CACHE_CAPACITY,
};
