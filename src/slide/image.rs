//! The `Image` dispatcher: one loaded slide behind a uniform region API.
//!
//! An [`Image`] owns its backend (TIFF, OpenSlide, iSyntax or a simple
//! raster), the dense pyramid of [`LevelImage`]s, and the per-tile streaming
//! flags. `read_region` materialises any rectangle at any level as BGRA (or
//! luminance float) pixels, falling back to a coarser existing level with
//! upscaling when the requested level is missing from the file.
//!
//! The dispatcher is a match over a backend sum type; no backend leaks its
//! container details past this module.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ImageError;
use crate::format::isyntax::IsyntaxImage;
use crate::format::tiff::{self, TiffSlide};
use crate::format::{detect_format, jpeg, SlideFormat};
use crate::io::{ByteSource, RemoteSource};

use super::openslide::RegionReader;
use super::simple::{SimpleImage, SIMPLE_TILE_SIZE};

/// Maximum pyramid depth an image exposes.
pub const MAX_LEVEL_COUNT: u32 = 16;

/// Shared handle to any byte source.
pub type SharedSource = Arc<dyn ByteSource>;

static NEXT_IMAGE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Pixel formats
// =============================================================================

/// Output pixel format of `read_region`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit B, G, R, A bytes
    Bgra8,
    /// 32-bit float luminance in [0, 1], little-endian
    F32Y,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

// =============================================================================
// Tile streaming state
// =============================================================================

/// Per-tile streaming flags, shared between the streamer, the cache and the
/// decode workers. All fields are atomics: tiles are touched from several
/// threads but never hold pixel data themselves.
#[derive(Debug, Default)]
pub struct Tile {
    /// The backend reported a zero-length payload; renders as background
    pub is_empty: AtomicBool,
    /// Decoded pixels are resident in the tile cache
    pub is_cached: AtomicBool,
    /// A decode task is queued or running; the single-flight key
    pub is_submitted_for_loading: AtomicBool,
    /// Eviction must skip this tile
    pub need_keep_in_cache: AtomicBool,
    /// The renderer wants this tile uploaded
    pub need_gpu_residency: AtomicBool,
    /// Frame timestamp of the last draw, drives eviction order
    pub time_last_drawn: AtomicU64,
}

impl Tile {
    /// Try to claim this tile for loading. Returns false if a task already
    /// holds the claim.
    pub fn try_submit(&self) -> bool {
        !self.is_submitted_for_loading.swap(true, Ordering::AcqRel)
    }

    /// Release the loading claim (decode finished or was cancelled).
    pub fn finish_submit(&self) {
        self.is_submitted_for_loading.store(false, Ordering::Release);
    }
}

// =============================================================================
// LevelImage
// =============================================================================

/// One level of the dense pyramid.
///
/// Every level slot in `0..level_count` exists in the array; `exists` is
/// false for levels missing from the file, which are still renderable by
/// upscaling a coarser level.
pub struct LevelImage {
    pub level: u32,
    pub exists: bool,
    pub downsample_factor: f64,
    pub width_in_pixels: u32,
    pub height_in_pixels: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// `width_in_tiles * height_in_tiles` streaming states
    pub tiles: Vec<Tile>,
}

impl LevelImage {
    fn new(
        level: u32,
        exists: bool,
        width_in_pixels: u32,
        height_in_pixels: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Self {
        let width_in_tiles = width_in_pixels.div_ceil(tile_width).max(1);
        let height_in_tiles = height_in_pixels.div_ceil(tile_height).max(1);
        let mut tiles = Vec::with_capacity((width_in_tiles * height_in_tiles) as usize);
        tiles.resize_with((width_in_tiles * height_in_tiles) as usize, Tile::default);

        Self {
            level,
            exists,
            downsample_factor: (1u64 << level) as f64,
            width_in_pixels,
            height_in_pixels,
            width_in_tiles,
            height_in_tiles,
            tile_width,
            tile_height,
            tiles,
        }
    }

    /// Streaming state of one tile.
    pub fn tile(&self, tile_x: u32, tile_y: u32) -> Option<&Tile> {
        if tile_x >= self.width_in_tiles || tile_y >= self.height_in_tiles {
            return None;
        }
        self.tiles
            .get((tile_y * self.width_in_tiles + tile_x) as usize)
    }
}

// =============================================================================
// Backend
// =============================================================================

enum Backend {
    Tiff {
        slide: TiffSlide,
        source: SharedSource,
    },
    OpenSlide(Box<dyn RegionReader>),
    Isyntax(IsyntaxImage<SharedSource>),
    Simple(SimpleImage),
}

impl Backend {
    const fn tag(&self) -> &'static str {
        match self {
            Backend::Tiff { .. } => "tiff",
            Backend::OpenSlide(_) => "openslide",
            Backend::Isyntax(_) => "isyntax",
            Backend::Simple(_) => "simple",
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// One loaded slide: backend, pyramid geometry, streaming state.
pub struct Image {
    id: u64,
    identifier: String,
    backend: Backend,
    is_deleted: AtomicBool,
    mpp: Mutex<(f64, f64)>,
    levels: Vec<LevelImage>,
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    remote: bool,
}

impl Image {
    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Open a slide from a byte source, detecting its format.
    pub async fn open(source: SharedSource) -> Result<Arc<Self>, ImageError> {
        let format = detect_format(&source).await?;
        debug!(
            identifier = source.identifier(),
            format = format.name(),
            "opening image"
        );

        match format {
            SlideFormat::Tiff => {
                let slide = TiffSlide::parse(&source).await?;
                Ok(Arc::new(Self::from_tiff(slide, source)))
            }
            SlideFormat::Isyntax => {
                let engine = IsyntaxImage::open(source.clone()).await?;
                Ok(Arc::new(Self::from_isyntax(engine, source.identifier())))
            }
            SlideFormat::Simple => {
                let bytes = source.read_exact_at(0, source.size() as usize).await?;
                let simple = SimpleImage::decode(&bytes)?;
                Ok(Arc::new(Self::from_simple(simple, source.identifier())))
            }
        }
    }

    /// Open a remote TIFF via the wire-metadata endpoint: one request for
    /// the serialised header, range batches for tiles afterwards.
    pub async fn open_remote_tiff(remote: RemoteSource) -> Result<Arc<Self>, ImageError> {
        let header = remote.fetch_header().await?;
        let slide = tiff::parse_metadata(&header)?;
        let source: SharedSource = Arc::new(remote);
        Ok(Arc::new(Self::from_tiff(slide, source)))
    }

    /// Wrap an externally-decoded pyramid (OpenSlide).
    pub fn from_region_reader(
        reader: Box<dyn RegionReader>,
        identifier: impl Into<String>,
    ) -> Arc<Self> {
        let (width, height) = reader.level_dimensions(0).unwrap_or((0, 0));
        let level_count = reader.level_count().min(MAX_LEVEL_COUNT);
        let (mpp_x, mpp_y) = reader.mpp().unwrap_or((1.0, 1.0));

        let tile_width = SIMPLE_TILE_SIZE;
        let tile_height = SIMPLE_TILE_SIZE;
        let levels = (0..level_count.max(1))
            .map(|level| {
                let (w, h) = reader.level_dimensions(level).unwrap_or((1, 1));
                LevelImage::new(level, true, w, h, tile_width, tile_height)
            })
            .collect();

        Arc::new(Self {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            identifier: identifier.into(),
            backend: Backend::OpenSlide(reader),
            is_deleted: AtomicBool::new(false),
            mpp: Mutex::new((mpp_x, mpp_y)),
            levels,
            width,
            height,
            tile_width,
            tile_height,
            remote: false,
        })
    }

    fn from_tiff(slide: TiffSlide, source: SharedSource) -> Self {
        let (width, height) = slide.dimensions();
        let level_count = slide.level_count().clamp(1, MAX_LEVEL_COUNT);
        let (base_tw, base_th) = slide
            .levels
            .first()
            .map(|l| (l.tile_width, l.tile_height))
            .unwrap_or((512, 512));

        let levels = (0..level_count)
            .map(|level| match slide.level(level) {
                Some(l) => LevelImage::new(level, true, l.width, l.height, l.tile_width, l.tile_height),
                None => LevelImage::new(
                    level,
                    false,
                    (width >> level).max(1),
                    (height >> level).max(1),
                    base_tw,
                    base_th,
                ),
            })
            .collect();

        let remote = source.is_remote();
        Self {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            identifier: source.identifier().to_string(),
            mpp: Mutex::new((slide.mpp_x, slide.mpp_y)),
            backend: Backend::Tiff { slide, source },
            is_deleted: AtomicBool::new(false),
            levels,
            width,
            height,
            tile_width: base_tw,
            tile_height: base_th,
            remote,
        }
    }

    fn from_isyntax(engine: IsyntaxImage<SharedSource>, identifier: &str) -> Self {
        let container = engine.container();
        let (width, height) = (container.width, container.height);
        let (tile_width, tile_height) = (container.tile_width, container.tile_height);
        let level_count = container.level_count.clamp(1, MAX_LEVEL_COUNT);
        let (mpp_x, mpp_y) = engine.mpp();

        // The iSyntax tile grid is fixed by the container, not by pixel
        // division: use its per-level tile counts directly.
        let levels = (0..level_count)
            .map(|level| {
                let grid = &container.levels[level as usize];
                let mut li = LevelImage::new(
                    level,
                    true,
                    (width >> level).max(1),
                    (height >> level).max(1),
                    tile_width,
                    tile_height,
                );
                li.width_in_tiles = grid.width_in_tiles;
                li.height_in_tiles = grid.height_in_tiles;
                li.tiles = Vec::new();
                li.tiles
                    .resize_with((grid.width_in_tiles * grid.height_in_tiles) as usize, Tile::default);
                li
            })
            .collect();

        Self {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            identifier: identifier.to_string(),
            backend: Backend::Isyntax(engine),
            is_deleted: AtomicBool::new(false),
            mpp: Mutex::new((mpp_x, mpp_y)),
            levels,
            width,
            height,
            tile_width,
            tile_height,
            remote: false,
        }
    }

    fn from_simple(simple: SimpleImage, identifier: &str) -> Self {
        let (width, height) = simple.dimensions();
        let levels = vec![LevelImage::new(
            0,
            true,
            width,
            height,
            SIMPLE_TILE_SIZE,
            SIMPLE_TILE_SIZE,
        )];

        Self {
            id: NEXT_IMAGE_ID.fetch_add(1, Ordering::Relaxed),
            identifier: identifier.to_string(),
            backend: Backend::Simple(simple),
            is_deleted: AtomicBool::new(false),
            mpp: Mutex::new((1.0, 1.0)),
            levels,
            width,
            height,
            tile_width: SIMPLE_TILE_SIZE,
            tile_height: SIMPLE_TILE_SIZE,
            remote: false,
        }
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Process-unique image id; part of every tile cache key.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Source identifier (file path or URL).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Backend family name ("tiff", "openslide", "isyntax", "simple").
    pub fn backend_name(&self) -> &'static str {
        self.backend.tag()
    }

    /// Full-resolution pixel dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Number of levels in the dense pyramid.
    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Tile dimensions shared by all levels.
    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    /// Whether tile payloads travel over the network.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// The pyramid levels.
    pub fn levels(&self) -> &[LevelImage] {
        &self.levels
    }

    /// One pyramid level.
    pub fn level(&self, level: u32) -> Option<&LevelImage> {
        self.levels.get(level as usize)
    }

    /// Microns per pixel at level 0.
    pub fn mpp(&self) -> (f64, f64) {
        *self.mpp.lock()
    }

    /// Set the resolution. Per-level micron geometry is derived from this
    /// value, so the update is atomic across all levels.
    pub fn set_mpp(&self, mpp_x: f64, mpp_y: f64) {
        debug_assert!(mpp_x > 0.0 && mpp_y > 0.0);
        *self.mpp.lock() = (mpp_x, mpp_y);
    }

    /// Microns per pixel at a level.
    pub fn level_um_per_pixel(&self, level: u32) -> (f64, f64) {
        let (mpp_x, mpp_y) = self.mpp();
        let factor = (1u64 << level.min(MAX_LEVEL_COUNT)) as f64;
        (mpp_x * factor, mpp_y * factor)
    }

    /// Physical tile extent at a level, in microns.
    pub fn tile_side_in_um(&self, level: u32) -> (f64, f64) {
        let (um_x, um_y) = self.level_um_per_pixel(level);
        (um_x * self.tile_width as f64, um_y * self.tile_height as f64)
    }

    /// Whether the image has been closed; queued tasks bail out on this.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted.load(Ordering::Acquire)
    }

    /// Mark the image closed. In-flight tasks observe the flag
    /// cooperatively; memory is released when the last reference drops.
    pub fn close(&self) {
        self.is_deleted.store(true, Ordering::Release);
    }

    /// Whether the iSyntax bootstrap (top-chunk load) has completed.
    /// Always true for other backends.
    pub fn first_load_complete(&self) -> bool {
        match &self.backend {
            Backend::Isyntax(engine) => engine.first_load_complete(),
            _ => true,
        }
    }

    /// Run the iSyntax first load; a no-op on other backends.
    pub async fn ensure_first_load(&self) -> Result<(), ImageError> {
        match &self.backend {
            Backend::Isyntax(engine) => engine.ensure_first_load().await,
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Tile decoding
    // -------------------------------------------------------------------------

    /// Decode one tile at an existing level into BGRA pixels
    /// (`tile_width * tile_height * 4` bytes).
    ///
    /// Empty tiles decode to fully transparent pixels and set the tile's
    /// `is_empty` flag.
    pub async fn decode_tile(
        &self,
        level: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<Vec<u8>, ImageError> {
        let level_image = self
            .levels
            .get(level as usize)
            .ok_or(ImageError::LevelUnavailable(level))?;
        if !level_image.exists {
            return Err(ImageError::LevelUnavailable(level));
        }
        if tile_x >= level_image.width_in_tiles || tile_y >= level_image.height_in_tiles {
            return Err(ImageError::RegionOutOfBounds {
                level,
                x: tile_x as i64,
                y: tile_y as i64,
                w: 1,
                h: 1,
            });
        }

        match &self.backend {
            Backend::Tiff { slide, source } => {
                let tiff_level = slide
                    .level(level)
                    .ok_or(ImageError::LevelUnavailable(level))?;
                let (offset, byte_count) = tiff_level
                    .tile_location(tile_x, tile_y)
                    .ok_or(ImageError::RegionOutOfBounds {
                        level,
                        x: tile_x as i64,
                        y: tile_y as i64,
                        w: 1,
                        h: 1,
                    })?;

                let tile_w = tiff_level.tile_width;
                let tile_h = tiff_level.tile_height;
                let mut out = vec![0u8; (tile_w * tile_h * 4) as usize];

                if byte_count == 0 {
                    // Background tile: transparent, no read
                    if let Some(tile) = level_image.tile(tile_x, tile_y) {
                        tile.is_empty.store(true, Ordering::Release);
                    }
                    return Ok(out);
                }

                let payload = source.read_exact_at(offset, byte_count as usize).await?;
                let (valid_w, valid_h) = tiff_level
                    .tile_valid_extent(tile_x, tile_y)
                    .unwrap_or((tile_w, tile_h));

                jpeg::decode_tile_bgra(
                    tiff_level.jpeg_tables.as_deref(),
                    &payload,
                    tile_w,
                    tile_h,
                    valid_w,
                    valid_h,
                    &mut out,
                )?;

                if jpeg::is_empty_stream(&payload) {
                    if let Some(tile) = level_image.tile(tile_x, tile_y) {
                        tile.is_empty.store(true, Ordering::Release);
                    }
                }
                Ok(out)
            }
            Backend::OpenSlide(reader) => {
                reader
                    .read_region(
                        level,
                        (tile_x * self.tile_width) as i64,
                        (tile_y * self.tile_height) as i64,
                        self.tile_width,
                        self.tile_height,
                    )
                    .await
            }
            Backend::Isyntax(engine) => {
                if !engine.tile_exists(level, tile_x, tile_y) && engine.first_load_complete() {
                    // Background tile with no code-block: reconstruct anyway
                    // (LL may still be donated), unless nothing is resident.
                    if let Some(t) = level_image.tile(tile_x, tile_y) {
                        t.is_empty.store(true, Ordering::Release);
                    }
                }
                engine.load_tile(level, tile_x, tile_y).await
            }
            Backend::Simple(simple) => Ok(simple.tile_bgra(tile_x, tile_y)),
        }
    }

    /// Decode a batch of tiles, coalescing I/O where the backend allows.
    ///
    /// For a TIFF over a remote range endpoint the whole batch collapses
    /// into one request whose URL carries every `(offset, length)` pair in
    /// wishlist order; other backends decode tile by tile.
    pub async fn decode_tile_batch(
        &self,
        coords: &[(u32, u32, u32)],
    ) -> Vec<((u32, u32, u32), Result<Vec<u8>, ImageError>)> {
        if let Backend::Tiff { slide, source } = &self.backend {
            // Build the coalesced request list; empty and invalid tiles
            // resolve locally.
            let mut requests: Vec<(u64, usize)> = Vec::new();
            let mut fetch_plan: Vec<Option<usize>> = Vec::with_capacity(coords.len());

            for &(level, tile_x, tile_y) in coords {
                let location = slide
                    .level(level)
                    .and_then(|l| l.tile_location(tile_x, tile_y));
                match location {
                    Some((offset, byte_count)) if byte_count > 0 => {
                        fetch_plan.push(Some(requests.len()));
                        requests.push((offset, byte_count as usize));
                    }
                    _ => fetch_plan.push(None),
                }
            }

            let batch = if requests.is_empty() {
                Ok(bytes::Bytes::new())
            } else {
                source.read_batch(&requests).await
            };

            let batch = match batch {
                Ok(bytes) => bytes,
                Err(e) => {
                    // The whole request failed; every tile reports the error
                    return coords
                        .iter()
                        .map(|&c| (c, Err(ImageError::Io(e.clone()))))
                        .collect();
                }
            };

            // Slice the concatenated response back apart in request order
            let mut offsets_in_batch = Vec::with_capacity(requests.len());
            let mut cursor = 0usize;
            for &(_, len) in &requests {
                offsets_in_batch.push(cursor);
                cursor += len;
            }

            let mut results = Vec::with_capacity(coords.len());
            for (&(level, tile_x, tile_y), plan) in coords.iter().zip(fetch_plan) {
                let result = match plan {
                    None => self.decode_tile(level, tile_x, tile_y).await,
                    Some(request_index) => {
                        let (_, len) = requests[request_index];
                        let start = offsets_in_batch[request_index];
                        let payload = batch.slice(start..start + len);
                        self.decode_tiff_payload(slide, level, tile_x, tile_y, &payload)
                    }
                };
                results.push(((level, tile_x, tile_y), result));
            }
            return results;
        }

        let mut results = Vec::with_capacity(coords.len());
        for &(level, tile_x, tile_y) in coords {
            let result = self.decode_tile(level, tile_x, tile_y).await;
            results.push(((level, tile_x, tile_y), result));
        }
        results
    }

    /// Decode one TIFF tile payload that is already in memory.
    fn decode_tiff_payload(
        &self,
        slide: &TiffSlide,
        level: u32,
        tile_x: u32,
        tile_y: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, ImageError> {
        let tiff_level = slide
            .level(level)
            .ok_or(ImageError::LevelUnavailable(level))?;
        let tile_w = tiff_level.tile_width;
        let tile_h = tiff_level.tile_height;
        let mut out = vec![0u8; (tile_w * tile_h * 4) as usize];

        let (valid_w, valid_h) = tiff_level
            .tile_valid_extent(tile_x, tile_y)
            .unwrap_or((tile_w, tile_h));

        jpeg::decode_tile_bgra(
            tiff_level.jpeg_tables.as_deref(),
            payload,
            tile_w,
            tile_h,
            valid_w,
            valid_h,
            &mut out,
        )?;

        if jpeg::is_empty_stream(payload) {
            if let Some(tile) = self
                .levels
                .get(level as usize)
                .and_then(|l| l.tile(tile_x, tile_y))
            {
                tile.is_empty.store(true, Ordering::Release);
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Region reads
    // -------------------------------------------------------------------------

    /// Materialise a rectangle at a level into `dst`.
    ///
    /// `x, y, w, h` are in the requested level's pixel space; `dst` must
    /// hold `w * h * 4` bytes. A missing level falls back to the nearest
    /// coarser existing level with nearest-neighbour upscaling.
    pub async fn read_region(
        &self,
        level: u32,
        x: i64,
        y: i64,
        w: u32,
        h: u32,
        dst: &mut [u8],
        format: PixelFormat,
    ) -> Result<(), ImageError> {
        if dst.len() < (w as usize * h as usize) * format.bytes_per_pixel() {
            return Err(ImageError::RegionOutOfBounds { level, x, y, w, h });
        }

        let source_level = self.resolve_level(level)?;
        let bgra = if source_level == level {
            self.read_region_bgra(level, x, y, w, h).await?
        } else {
            // Upscale from the coarser level
            let shift = source_level - level;
            let sx = x >> shift;
            let sy = y >> shift;
            let sw = ((x + w as i64 - 1) >> shift) - sx + 1;
            let sh = ((y + h as i64 - 1) >> shift) - sy + 1;
            let coarse = self
                .read_region_bgra(source_level, sx, sy, sw as u32, sh as u32)
                .await?;

            let mut out = vec![0u8; (w as usize * h as usize) * 4];
            for py in 0..h as i64 {
                for px in 0..w as i64 {
                    let cx = ((x + px) >> shift) - sx;
                    let cy = ((y + py) >> shift) - sy;
                    let s = ((cy * sw + cx) * 4) as usize;
                    let d = ((py * w as i64 + px) * 4) as usize;
                    out[d..d + 4].copy_from_slice(&coarse[s..s + 4]);
                }
            }
            out
        };

        match format {
            PixelFormat::Bgra8 => dst[..bgra.len()].copy_from_slice(&bgra),
            PixelFormat::F32Y => {
                for (i, px) in bgra.chunks_exact(4).enumerate() {
                    let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
                    let luma = (0.2126 * r + 0.7152 * g + 0.0722 * b) / 255.0;
                    dst[i * 4..i * 4 + 4].copy_from_slice(&luma.to_le_bytes());
                }
            }
        }

        Ok(())
    }

    /// Nearest decodable level for a request: the level itself when it
    /// exists, otherwise the closest coarser existing level.
    fn resolve_level(&self, level: u32) -> Result<u32, ImageError> {
        if let Some(l) = self.levels.get(level as usize) {
            if l.exists {
                return Ok(level);
            }
        }
        for l in (level + 1)..self.level_count() {
            if self.levels[l as usize].exists {
                warn!(requested = level, substitute = l, "level missing; upscaling");
                return Ok(l);
            }
        }
        Err(ImageError::LevelUnavailable(level))
    }

    /// Assemble a BGRA region from tiles at an existing level.
    async fn read_region_bgra(
        &self,
        level: u32,
        x: i64,
        y: i64,
        w: u32,
        h: u32,
    ) -> Result<Vec<u8>, ImageError> {
        let level_image = &self.levels[level as usize];
        let tile_w = level_image.tile_width as i64;
        let tile_h = level_image.tile_height as i64;

        let mut out = vec![0u8; (w as usize * h as usize) * 4];
        if w == 0 || h == 0 {
            return Ok(out);
        }

        let tx0 = (x.max(0) / tile_w) as u32;
        let ty0 = (y.max(0) / tile_h) as u32;
        let tx1 = (((x + w as i64 - 1).max(0)) / tile_w) as u32;
        let ty1 = (((y + h as i64 - 1).max(0)) / tile_h) as u32;

        for ty in ty0..=ty1.min(level_image.height_in_tiles.saturating_sub(1)) {
            for tx in tx0..=tx1.min(level_image.width_in_tiles.saturating_sub(1)) {
                let pixels = self.decode_tile(level, tx, ty).await?;

                // Intersect the tile with the requested region
                let tile_origin_x = tx as i64 * tile_w;
                let tile_origin_y = ty as i64 * tile_h;
                let ix0 = x.max(tile_origin_x);
                let iy0 = y.max(tile_origin_y);
                let ix1 = (x + w as i64).min(tile_origin_x + tile_w);
                let iy1 = (y + h as i64).min(tile_origin_y + tile_h);
                if ix0 >= ix1 || iy0 >= iy1 {
                    continue;
                }

                for row in iy0..iy1 {
                    let src_off =
                        (((row - tile_origin_y) * tile_w + (ix0 - tile_origin_x)) * 4) as usize;
                    let dst_off = (((row - y) * w as i64 + (ix0 - x)) * 4) as usize;
                    let len = ((ix1 - ix0) * 4) as usize;
                    out[dst_off..dst_off + len]
                        .copy_from_slice(&pixels[src_off..src_off + len]);
                }
            }
        }

        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slide::openslide::test_support::SolidRegionReader;

    fn solid_image() -> Arc<Image> {
        Image::from_region_reader(
            Box::new(SolidRegionReader {
                width: 2048,
                height: 1024,
                levels: 3,
                bgra: [10, 20, 30, 255],
            }),
            "test://solid",
        )
    }

    #[test]
    fn test_pyramid_geometry() {
        let image = solid_image();
        assert_eq!(image.level_count(), 3);
        assert_eq!(image.dimensions(), (2048, 1024));

        let level1 = image.level(1).unwrap();
        assert_eq!(level1.width_in_pixels, 1024);
        assert_eq!(level1.downsample_factor, 2.0);
        assert_eq!(level1.width_in_tiles, 2);
    }

    #[test]
    fn test_mpp_propagates_to_levels() {
        let image = solid_image();
        image.set_mpp(0.25, 0.25);

        let (um_x, _) = image.level_um_per_pixel(0);
        assert_eq!(um_x, 0.25);
        let (um_x2, _) = image.level_um_per_pixel(3);
        assert_eq!(um_x2, 2.0);

        let (tile_um_x, _) = image.tile_side_in_um(0);
        assert_eq!(tile_um_x, 0.25 * 512.0);
    }

    #[test]
    fn test_close_sets_deleted() {
        let image = solid_image();
        assert!(!image.is_deleted());
        image.close();
        assert!(image.is_deleted());
    }

    #[test]
    fn test_tile_submit_claim_is_exclusive() {
        let image = solid_image();
        let tile = image.level(0).unwrap().tile(0, 0).unwrap();

        assert!(tile.try_submit());
        assert!(!tile.try_submit());
        tile.finish_submit();
        assert!(tile.try_submit());
    }

    #[tokio::test]
    async fn test_decode_tile_via_region_reader() {
        let image = solid_image();
        let pixels = image.decode_tile(0, 0, 0).await.unwrap();
        assert_eq!(pixels.len(), 512 * 512 * 4);
        assert_eq!(&pixels[..4], &[10, 20, 30, 255]);
    }

    #[tokio::test]
    async fn test_read_region_bgra() {
        let image = solid_image();
        let mut dst = vec![0u8; 64 * 64 * 4];
        image
            .read_region(0, 100, 100, 64, 64, &mut dst, PixelFormat::Bgra8)
            .await
            .unwrap();
        assert_eq!(&dst[..4], &[10, 20, 30, 255]);
    }

    #[tokio::test]
    async fn test_read_region_f32y() {
        let image = solid_image();
        let mut dst = vec![0u8; 8 * 8 * 4];
        image
            .read_region(0, 0, 0, 8, 8, &mut dst, PixelFormat::F32Y)
            .await
            .unwrap();

        let luma = f32::from_le_bytes(dst[0..4].try_into().unwrap());
        let expected = (0.2126 * 30.0 + 0.7152 * 20.0 + 0.0722 * 10.0) / 255.0;
        assert!((luma - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_read_region_level_out_of_range() {
        let image = solid_image();
        let mut dst = vec![0u8; 16];
        let result = image
            .read_region(9, 0, 0, 2, 2, &mut dst, PixelFormat::Bgra8)
            .await;
        assert!(matches!(result, Err(ImageError::LevelUnavailable(9))));
    }

    #[test]
    fn test_image_ids_are_unique() {
        let a = solid_image();
        let b = solid_image();
        assert_ne!(a.id(), b.id());
    }
}
