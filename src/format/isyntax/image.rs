//! The per-slide iSyntax engine: open, first-load, tile reconstruction.
//!
//! Coefficients cascade down the pyramid: a tile's LL plane is *donated* by
//! its parent's inverse transform, so nothing can be rendered until the
//! *first load* has read and transformed the top chunk levels (the top
//! scale plus up to two below it, depending on `top_scale % 3`). After
//! that, reconstructing any tile is:
//!
//! 1. ensure the 3x3 neighbourhood has H coefficients (decompress from the
//!    owning chunks) and LL coefficients (recursively reconstruct parents),
//! 2. stitch + inverse transform each of the three colour channels,
//! 3. donate the result's quadrants to the four child tiles,
//! 4. recombine YCoCg into a BGRA tile.
//!
//! Pyramid state lives behind one short-hold mutex; decompression and the
//! transform run outside it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ImageError, IsyntaxError};
use crate::io::ByteSource;

use super::container::{DataChunk, IsyntaxContainer, TileRef};
use super::hulsken;
use super::idwt::{
    extract_child_ll, recombine_ycocg_to_bgra, transform_channel, NeighborCoeffs,
    Neighborhood, DUMMY_BLACK, DUMMY_WHITE,
};
use super::xml;

/// XML headers are read in chunks of this size while hunting for the
/// `0x04` terminator.
const XML_READ_CHUNK: usize = 4 * 1024 * 1024;

/// Upper bound on the XML header size.
const XML_MAX_SIZE: usize = 512 * 1024 * 1024;

/// Chunk payloads kept resident for re-decompression of sibling blocks.
const CHUNK_CACHE_ENTRIES: usize = 32;

/// Default Hulsken compressor version; real files declare it in the
/// derivation description, version 1 in every file observed.
const DEFAULT_COMPRESSOR_VERSION: u8 = 1;

// =============================================================================
// Pyramid state
// =============================================================================

#[derive(Default, Clone)]
struct ChannelState {
    coeff_ll: Option<Arc<Vec<i16>>>,
    coeff_h: Option<Arc<Vec<i16>>>,
}

#[derive(Default, Clone)]
struct TileState {
    channels: [ChannelState; 3],
    /// Set once this tile's transform has run and donated to its children
    is_loaded: bool,
}

struct PyramidState {
    /// `levels[scale]` holds that scale's tile states in row-major order
    levels: Vec<Vec<TileState>>,
}

// =============================================================================
// IsyntaxImage
// =============================================================================

/// An opened iSyntax slide.
pub struct IsyntaxImage<S> {
    source: S,
    container: IsyntaxContainer,
    mpp_x: f64,
    mpp_y: f64,
    compressor_version: u8,
    state: Mutex<PyramidState>,
    chunk_cache: Mutex<LruCache<usize, Bytes>>,
    first_load_complete: AtomicBool,
    first_load_guard: tokio::sync::Mutex<()>,
}

impl<S: ByteSource> IsyntaxImage<S> {
    /// Open an iSyntax container: scan the XML header, parse the block
    /// header table and seek table, build the tile grid.
    pub async fn open(source: S) -> Result<Self, IsyntaxError> {
        let (xml_bytes, data_offset) = read_xml_header(&source).await?;
        let header = xml::parse_header(&xml_bytes)?;

        let wsi = header
            .wsi()
            .ok_or_else(|| IsyntaxError::MalformedXml("no WSI image in header".to_string()))?;
        let (block_width, block_height) = header.block_dimensions().ok_or_else(|| {
            IsyntaxError::MalformedXml("no block header template".to_string())
        })?;

        let container =
            IsyntaxContainer::open(&source, wsi, block_width, block_height, data_offset).await?;

        // Scanners occasionally omit the pixel spacing; zero can never be right.
        let mpp_x = if header.mpp_x > 0.0 { header.mpp_x } else { 0.25 };
        let mpp_y = if header.mpp_y > 0.0 { header.mpp_y } else { 0.25 };

        let levels = container
            .levels
            .iter()
            .map(|l| vec![TileState::default(); l.tile_count as usize])
            .collect();

        debug!(
            identifier = source.identifier(),
            width = container.width,
            height = container.height,
            levels = container.level_count,
            codeblocks = container.codeblocks.len(),
            chunks = container.chunks.len(),
            "opened iSyntax container"
        );

        Ok(Self {
            source,
            container,
            mpp_x,
            mpp_y,
            compressor_version: DEFAULT_COMPRESSOR_VERSION,
            state: Mutex::new(PyramidState { levels }),
            chunk_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CHUNK_CACHE_ENTRIES).unwrap(),
            )),
            first_load_complete: AtomicBool::new(false),
            first_load_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Container geometry.
    pub fn container(&self) -> &IsyntaxContainer {
        &self.container
    }

    /// Microns per pixel at full resolution.
    pub fn mpp(&self) -> (f64, f64) {
        (self.mpp_x, self.mpp_y)
    }

    /// Whether the pyramid-top bootstrap has run.
    pub fn first_load_complete(&self) -> bool {
        self.first_load_complete.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // First load
    // -------------------------------------------------------------------------

    /// Bootstrap the top chunk levels.
    ///
    /// Reads every top-scale chunk, decompresses the LL and H blocks of all
    /// three colours, transforms the full top level (donating LL one level
    /// down), then repeats for the next one or two levels if the top chunks
    /// carry them. Without this no tile at any level can be reconstructed.
    pub async fn ensure_first_load(&self) -> Result<(), ImageError> {
        if self.first_load_complete() {
            return Ok(());
        }
        let _guard = self.first_load_guard.lock().await;
        if self.first_load_complete() {
            return Ok(());
        }

        let top = self.container.max_scale;
        let top_level = &self.container.levels[top as usize];
        // The number of levels carried by the top chunks follows the chunk
        // band convention: top scale 8 carries 8/7/6, top scale 7 only 7/6.
        let levels_in_chunk = top % 3 + 1;

        // Read chunks and install top-scale coefficients
        for tile_y in 0..top_level.height_in_tiles {
            for tile_x in 0..top_level.width_in_tiles {
                let Some(tile_ref) = self.container.tile_ref(top, tile_x, tile_y) else {
                    continue;
                };
                if !tile_ref.exists {
                    continue;
                }
                let chunk = self.container.chunks[tile_ref.chunk_index];
                let per_color = chunk.codeblock_count_per_color as usize;
                let data = self.chunk_data(tile_ref.chunk_index, &chunk).await?;

                for color in 0..3usize {
                    let base = chunk.top_codeblock_index + color * per_color;
                    let h_index = base;
                    let ll_index = base + per_color - 1;

                    let h = self.decompress_block(h_index, &data, chunk.offset, 3)?;
                    let ll = self.decompress_block(ll_index, &data, chunk.offset, 1)?;

                    let mut state = self.state.lock();
                    let tile = tile_state_mut(&mut state, &self.container, top, tile_x, tile_y);
                    tile.channels[color].coeff_h = Some(Arc::new(h));
                    tile.channels[color].coeff_ll = Some(Arc::new(ll));
                }
            }
        }

        // Transform the top level, then the further levels carried by the
        // same chunks (their H blocks install 2x2 / 4x4 per chunk).
        self.transform_whole_level(top).await?;

        if levels_in_chunk >= 2 {
            self.install_chunk_level(top - 1, 1, 2).await?;
            self.transform_whole_level(top - 1).await?;
        }
        if levels_in_chunk >= 3 {
            self.install_chunk_level(top - 2, 5, 4).await?;
            self.transform_whole_level(top - 2).await?;
        }

        self.first_load_complete.store(true, Ordering::Release);
        debug!(top_scale = top, levels_in_chunk, "iSyntax first load complete");
        Ok(())
    }

    /// Decompress H blocks for one chunk-carried level below the top.
    ///
    /// `first_index` is the per-colour codeblock index of the level's first
    /// block (1 for `top-1`, 5 for `top-2`); `step` is the tile stride of
    /// one chunk at this level (2 or 4).
    async fn install_chunk_level(
        &self,
        scale: u32,
        first_index: usize,
        step: u32,
    ) -> Result<(), ImageError> {
        let level = &self.container.levels[scale as usize];

        for tile_y in (0..level.height_in_tiles).step_by(step as usize) {
            for tile_x in (0..level.width_in_tiles).step_by(step as usize) {
                let Some(tile_ref) = self.container.tile_ref(scale, tile_x, tile_y) else {
                    continue;
                };
                if !tile_ref.exists {
                    continue;
                }
                let chunk = self.container.chunks[tile_ref.chunk_index];
                let per_color = chunk.codeblock_count_per_color as usize;
                let data = self.chunk_data(tile_ref.chunk_index, &chunk).await?;

                for color in 0..3usize {
                    for sub in 0..(step * step) {
                        let dx = sub % step;
                        let dy = sub / step;
                        let index = chunk.top_codeblock_index
                            + color * per_color
                            + first_index
                            + sub as usize;
                        let h = self.decompress_block(index, &data, chunk.offset, 3)?;

                        let nx = tile_x + dx;
                        let ny = tile_y + dy;
                        if nx >= level.width_in_tiles || ny >= level.height_in_tiles {
                            continue;
                        }
                        let mut state = self.state.lock();
                        let tile =
                            tile_state_mut(&mut state, &self.container, scale, nx, ny);
                        tile.channels[color as usize].coeff_h = Some(Arc::new(h));
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the inverse transform over every existing tile of a level,
    /// donating LL coefficients downward. Used during first load where all
    /// coefficients of the level are known resident.
    async fn transform_whole_level(&self, scale: u32) -> Result<(), ImageError> {
        let level = &self.container.levels[scale as usize];
        for tile_y in 0..level.height_in_tiles {
            for tile_x in 0..level.width_in_tiles {
                let exists = self
                    .container
                    .tile_ref(scale, tile_x, tile_y)
                    .map(|t| t.exists)
                    .unwrap_or(false);
                if !exists {
                    continue;
                }
                self.transform_tile(scale, tile_x, tile_y)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Chunk I/O and decompression
    // -------------------------------------------------------------------------

    /// Fetch (or reuse) the raw bytes of a chunk: one range read covers all
    /// of its code-blocks.
    async fn chunk_data(&self, chunk_index: usize, chunk: &DataChunk) -> Result<Bytes, ImageError> {
        if let Some(data) = self.chunk_cache.lock().get(&chunk_index) {
            return Ok(data.clone());
        }

        let (offset, len) = self.container.chunk_range(chunk);
        let data = self.source.read_exact_at(offset, len).await?;
        self.chunk_cache.lock().put(chunk_index, data.clone());
        Ok(data)
    }

    /// Decompress one code-block out of its chunk's bytes.
    fn decompress_block(
        &self,
        codeblock_index: usize,
        chunk_data: &Bytes,
        chunk_offset: u64,
        coeff_count: usize,
    ) -> Result<Vec<i16>, ImageError> {
        let codeblock = &self.container.codeblocks[codeblock_index];
        let start = codeblock
            .block_data_offset
            .checked_sub(chunk_offset)
            .unwrap_or(u64::MAX) as usize;
        let end = start.saturating_add(codeblock.block_size as usize);
        if end > chunk_data.len() {
            return Err(ImageError::Io(crate::error::IoError::Short {
                offset: codeblock.block_data_offset,
                requested: codeblock.block_size,
                actual: chunk_data.len().saturating_sub(start) as u64,
            }));
        }

        let decoded = hulsken::decompress(
            &chunk_data[start..end],
            self.container.block_width as usize,
            self.container.block_height as usize,
            coeff_count,
            self.compressor_version,
        )?;
        Ok(decoded)
    }

    /// Ensure a tile's H coefficients are resident (all three colours).
    async fn ensure_h(&self, scale: u32, tile_x: u32, tile_y: u32) -> Result<(), ImageError> {
        let Some(tile_ref) = self.container.tile_ref(scale, tile_x, tile_y) else {
            return Ok(());
        };
        if !tile_ref.exists {
            return Ok(()); // background tile: margins fall back to dummies
        }

        {
            let state = self.state.lock();
            let tile = tile_state(&state, &self.container, scale, tile_x, tile_y);
            if tile.channels.iter().all(|c| c.coeff_h.is_some()) {
                return Ok(());
            }
        }

        let chunk = self.container.chunks[tile_ref.chunk_index];
        let data = self.chunk_data(tile_ref.chunk_index, &chunk).await?;
        let per_color = chunk.codeblock_count_per_color;

        // Locate this tile's H block inside the chunk layout
        let top_block = &self.container.codeblocks[chunk.top_codeblock_index];
        let index_in_color = match chunk.scale - scale {
            0 => 0usize,
            1 => {
                let dx = tile_x - top_block.block_x * 2;
                let dy = tile_y - top_block.block_y * 2;
                1 + (dy * 2 + dx) as usize
            }
            2 => {
                let dx = tile_x - top_block.block_x * 4;
                let dy = tile_y - top_block.block_y * 4;
                5 + (dy * 4 + dx) as usize
            }
            depth => {
                warn!(scale, chunk_scale = chunk.scale, depth, "tile below its chunk band");
                return Ok(());
            }
        };

        for color in 0..3u32 {
            let index =
                chunk.top_codeblock_index + (color * per_color) as usize + index_in_color;
            let h = self.decompress_block(index, &data, chunk.offset, 3)?;

            let mut state = self.state.lock();
            let tile = tile_state_mut(&mut state, &self.container, scale, tile_x, tile_y);
            if tile.channels[color as usize].coeff_h.is_none() {
                tile.channels[color as usize].coeff_h = Some(Arc::new(h));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconstruction
    // -------------------------------------------------------------------------

    /// Reconstruct one tile to BGRA pixels (`tile_width x tile_height`).
    ///
    /// Triggers the first load if it has not run, then resolves the
    /// dependency chain up the pyramid.
    pub async fn load_tile(
        &self,
        scale: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<Vec<u8>, ImageError> {
        self.ensure_first_load().await?;
        self.reconstruct(scale, tile_x, tile_y).await
    }

    /// Recursive reconstruction; boxed because the future recurses through
    /// parent levels.
    fn reconstruct(
        &self,
        scale: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, ImageError>> + Send + '_>> {
        Box::pin(async move {
            let level = &self.container.levels[scale as usize];
            if tile_x >= level.width_in_tiles || tile_y >= level.height_in_tiles {
                return Err(ImageError::RegionOutOfBounds {
                    level: scale,
                    x: tile_x as i64,
                    y: tile_y as i64,
                    w: 1,
                    h: 1,
                });
            }

            // Resolve coefficients for the whole 3x3 neighbourhood: LL via
            // the parents, H via the chunks.
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = tile_x as i64 + dx;
                    let ny = tile_y as i64 + dy;
                    if nx < 0
                        || ny < 0
                        || nx >= level.width_in_tiles as i64
                        || ny >= level.height_in_tiles as i64
                    {
                        continue;
                    }
                    let (nx, ny) = (nx as u32, ny as u32);

                    if scale < self.container.max_scale && !self.has_ll(scale, nx, ny) {
                        self.reconstruct(scale + 1, nx / 2, ny / 2).await?;
                    }
                    self.ensure_h(scale, nx, ny).await?;
                }
            }

            self.transform_tile(scale, tile_x, tile_y)
        })
    }

    /// Stitch + transform + donate + recombine for one tile whose
    /// dependencies are already resident.
    fn transform_tile(
        &self,
        scale: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<Vec<u8>, ImageError> {
        let block_w = self.container.block_width as usize;
        let block_h = self.container.block_height as usize;
        let level = &self.container.levels[scale as usize];

        let workspaces: [Vec<i32>; 3] = std::array::from_fn(|color| {
            // Snapshot the neighbourhood's coefficient handles under the lock
            let snapshot: [[Option<(Option<Arc<Vec<i16>>>, Option<Arc<Vec<i16>>>)>; 3]; 3] = {
                let state = self.state.lock();
                let mut grid: [[Option<(Option<Arc<Vec<i16>>>, Option<Arc<Vec<i16>>>)>; 3]; 3] =
                    Default::default();
                for dy in 0..3i64 {
                    for dx in 0..3i64 {
                        let nx = tile_x as i64 + dx - 1;
                        let ny = tile_y as i64 + dy - 1;
                        if nx < 0
                            || ny < 0
                            || nx >= level.width_in_tiles as i64
                            || ny >= level.height_in_tiles as i64
                        {
                            continue;
                        }
                        let tile =
                            tile_state(&state, &self.container, scale, nx as u32, ny as u32);
                        let channel = &tile.channels[color];
                        grid[dy as usize][dx as usize] =
                            Some((channel.coeff_ll.clone(), channel.coeff_h.clone()));
                    }
                }
                grid
            };

            let mut neighborhood: Neighborhood<'_> = Default::default();
            for dy in 0..3 {
                for dx in 0..3 {
                    if let Some((ll, h)) = &snapshot[dy][dx] {
                        neighborhood[dy][dx] = Some(NeighborCoeffs {
                            ll: ll.as_deref().map(|v| v.as_slice()),
                            h: h.as_deref().map(|v| v.as_slice()),
                        });
                    }
                }
            }

            let ll_dummy = if color == 0 { DUMMY_WHITE } else { DUMMY_BLACK };
            transform_channel(&neighborhood, block_w, block_h, ll_dummy)
        });

        // Donate LL planes to the children before the Y plane is collapsed
        // to absolute values.
        if scale > 0 {
            let child_level = &self.container.levels[scale as usize - 1];
            let mut state = self.state.lock();
            for (color, workspace) in workspaces.iter().enumerate() {
                let children = extract_child_ll(workspace, block_w, block_h);
                let child_origin = (tile_x * 2, tile_y * 2);
                for (i, child_ll) in children.into_iter().enumerate() {
                    let cx = child_origin.0 + (i as u32 % 2);
                    let cy = child_origin.1 + (i as u32 / 2);
                    if cx >= child_level.width_in_tiles || cy >= child_level.height_in_tiles {
                        continue;
                    }
                    let child =
                        tile_state_mut(&mut state, &self.container, scale - 1, cx, cy);
                    if child.channels[color].coeff_ll.is_none() {
                        child.channels[color].coeff_ll = Some(Arc::new(child_ll));
                    }
                }
            }
            let tile = tile_state_mut(&mut state, &self.container, scale, tile_x, tile_y);
            tile.is_loaded = true;
        } else {
            let mut state = self.state.lock();
            let tile = tile_state_mut(&mut state, &self.container, scale, tile_x, tile_y);
            tile.is_loaded = true;
        }

        let [mut y_ws, co_ws, cg_ws] = workspaces;
        Ok(recombine_ycocg_to_bgra(
            &mut y_ws, &co_ws, &cg_ws, block_w, block_h,
        ))
    }

    /// Whether a tile's LL plane is resident for all three colours.
    fn has_ll(&self, scale: u32, tile_x: u32, tile_y: u32) -> bool {
        let state = self.state.lock();
        let tile = tile_state(&state, &self.container, scale, tile_x, tile_y);
        tile.channels.iter().all(|c| c.coeff_ll.is_some())
    }

    /// Whether a tile has completed its inverse transform.
    pub fn is_tile_loaded(&self, scale: u32, tile_x: u32, tile_y: u32) -> bool {
        let state = self.state.lock();
        tile_state(&state, &self.container, scale, tile_x, tile_y).is_loaded
    }

    /// Whether the tile exists in the file (background tiles do not).
    pub fn tile_exists(&self, scale: u32, tile_x: u32, tile_y: u32) -> bool {
        self.container
            .tile_ref(scale, tile_x, tile_y)
            .map(|t| t.exists)
            .unwrap_or(false)
    }

    /// Access to the tile reference table (for streamers and tests).
    pub fn tile_ref(&self, scale: u32, tile_x: u32, tile_y: u32) -> Option<TileRef> {
        self.container.tile_ref(scale, tile_x, tile_y)
    }
}

fn tile_state<'a>(
    state: &'a PyramidState,
    container: &IsyntaxContainer,
    scale: u32,
    tile_x: u32,
    tile_y: u32,
) -> &'a TileState {
    let level = &container.levels[scale as usize];
    &state.levels[scale as usize][(tile_y * level.width_in_tiles + tile_x) as usize]
}

fn tile_state_mut<'a>(
    state: &'a mut PyramidState,
    container: &IsyntaxContainer,
    scale: u32,
    tile_x: u32,
    tile_y: u32,
) -> &'a mut TileState {
    let level = &container.levels[scale as usize];
    &mut state.levels[scale as usize][(tile_y * level.width_in_tiles + tile_x) as usize]
}

// =============================================================================
// XML header scan
// =============================================================================

/// Read the XML header up to (but not including) the `0x04` terminator.
/// Returns the header bytes and the file offset of the first payload byte.
async fn read_xml_header<S: ByteSource>(source: &S) -> Result<(Vec<u8>, u64), IsyntaxError> {
    let mut header = Vec::new();
    let mut offset = 0u64;

    loop {
        let remaining = source.size().saturating_sub(offset);
        if remaining == 0 {
            return Err(IsyntaxError::MalformedXml(
                "no header terminator before end of file".to_string(),
            ));
        }
        let len = (XML_READ_CHUNK as u64).min(remaining) as usize;
        let chunk = source.read_exact_at(offset, len).await?;

        if let Some(at) = chunk.iter().position(|&b| b == 0x04) {
            header.extend_from_slice(&chunk[..at]);
            let data_offset = offset + at as u64 + 1;
            return Ok((header, data_offset));
        }

        header.extend_from_slice(&chunk);
        offset += len as u64;

        if header.len() > XML_MAX_SIZE {
            return Err(IsyntaxError::MalformedXml(
                "header exceeds maximum size".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::IoError;

    struct SliceSource {
        data: Bytes,
    }

    #[async_trait]
    impl ByteSource for SliceSource {
        async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
            let start = offset as usize;
            if start + len > self.data.len() {
                return Err(IoError::RangeOutOfBounds {
                    offset,
                    requested: len as u64,
                    size: self.data.len() as u64,
                });
            }
            Ok(self.data.slice(start..start + len))
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn identifier(&self) -> &str {
            "slice://test"
        }
    }

    #[tokio::test]
    async fn test_read_xml_header_finds_terminator() {
        let mut file = b"<DataObject></DataObject>".to_vec();
        file.push(0x04);
        file.extend_from_slice(b"BINARYPAYLOAD");

        let source = SliceSource {
            data: Bytes::from(file),
        };
        let (header, data_offset) = read_xml_header(&source).await.unwrap();
        assert_eq!(header, b"<DataObject></DataObject>");
        assert_eq!(data_offset, 26);
    }

    #[tokio::test]
    async fn test_read_xml_header_missing_terminator() {
        let source = SliceSource {
            data: Bytes::from_static(b"<DataObject></DataObject>"),
        };
        let result = read_xml_header(&source).await;
        assert!(matches!(result, Err(IsyntaxError::MalformedXml(_))));
    }
}
