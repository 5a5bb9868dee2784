//! Single-level raster backend.
//!
//! Plain JPEG/PNG files open as a one-level "pyramid": the whole image is
//! decoded once at open time and tiles are crops of the resident pixels.
//! Useful for overview exports and test assets; real slides use the tiled
//! backends.

use crate::error::ImageError;

/// Tile granularity the simple backend advertises.
pub const SIMPLE_TILE_SIZE: u32 = 512;

/// A fully-decoded single-level image.
pub struct SimpleImage {
    width: u32,
    height: u32,
    /// Packed BGRA pixels, row-major
    bgra: Vec<u8>,
}

impl SimpleImage {
    /// Decode a whole raster image from memory.
    pub fn decode(data: &[u8]) -> Result<Self, ImageError> {
        let decoded = image::load_from_memory(data).map_err(|e| ImageError::UnsupportedFormat {
            reason: format!("raster decode failed: {e}"),
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        let mut bgra = rgba.into_raw();
        for px in bgra.chunks_exact_mut(4) {
            px.swap(0, 2);
        }

        Ok(Self {
            width,
            height,
            bgra,
        })
    }

    /// Pixel dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Crop one tile; pixels beyond the image extent are transparent.
    pub fn tile_bgra(&self, tile_x: u32, tile_y: u32) -> Vec<u8> {
        let tile = SIMPLE_TILE_SIZE as usize;
        let mut out = vec![0u8; tile * tile * 4];

        let x0 = (tile_x * SIMPLE_TILE_SIZE) as usize;
        let y0 = (tile_y * SIMPLE_TILE_SIZE) as usize;
        if x0 >= self.width as usize || y0 >= self.height as usize {
            return out;
        }

        let copy_w = tile.min(self.width as usize - x0);
        let copy_h = tile.min(self.height as usize - y0);

        for row in 0..copy_h {
            let src = ((y0 + row) * self.width as usize + x0) * 4;
            let dst = row * tile * 4;
            out[dst..dst + copy_w * 4].copy_from_slice(&self.bgra[src..src + copy_w * 4]);
        }

        out
    }
}
