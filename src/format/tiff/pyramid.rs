//! TIFF pyramid parsing and level classification.
//!
//! WSI files contain multiple IFDs, but not all are pyramid levels: scanners
//! append macro overviews, label photographs and thumbnails to the same IFD
//! chain. This module walks the chain, classifies every IFD, and assigns each
//! tiled IFD a *discrete* downsample level so that level `l` always means a
//! `2^l` downsample of the main image.
//!
//! # Classification
//!
//! - IFD 0 is the main image (level 0) by definition.
//! - IFDs whose ImageDescription starts with "Macro" or "Label" are the
//!   macro and label images.
//! - Every other tiled IFD gets a level from `log2(main_width / ifd_width)`.
//!   Scanners round level dimensions up to a tile multiple, so the ratio is
//!   inexact; the tile-count constraint (the true width lies in
//!   `[(tiles_x-1)*tile_w + 1, tiles_x*tile_w]`) tightens the estimate. When
//!   the constraint does not isolate a unique level the parser falls back to
//!   `last_level + 1` — an approximation, logged as such.

use bytes::Bytes;
use tracing::warn;

use crate::error::TiffError;
use crate::io::ByteSource;

use super::parser::{Ifd, TiffHeader, BIGTIFF_HEADER_SIZE};
use super::tags::{Compression, Photometric, TiffTag};
use super::values::ValueReader;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of IFDs to parse (safety limit)
const MAX_IFDS: usize = 100;

/// Maximum discrete pyramid depth
pub const MAX_LEVEL_COUNT: u32 = 16;

/// Resolution unit code for centimetres
const RESOLUTION_UNIT_CENTIMETER: u16 = 3;

/// Microns per pixel assumed when the file carries no usable resolution
/// tags. The value matches what common 40x scanners produce; callers can
/// check [`TiffSlide::mpp_is_default`] and override it.
pub const DEFAULT_MPP_NO_RESOLUTION: f64 = 0.25;

// =============================================================================
// IfdKind
// =============================================================================

/// Classification of one IFD in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfdKind {
    /// A pyramid level with its discrete downsample exponent
    Level(u32),
    /// Macro overview image
    Macro,
    /// Slide label image
    Label,
    /// Anything else (thumbnails, masks); ignored by the core
    Unknown,
}

// =============================================================================
// TiffLevel
// =============================================================================

/// One fully-loaded pyramid level: geometry plus tile tables.
///
/// Tile offset/byte-count arrays are loaded eagerly — they are needed for
/// every tile read and for metadata serialisation, and fetching each array
/// is a single range request.
#[derive(Debug, Clone)]
pub struct TiffLevel {
    /// Discrete downsample exponent (width ≈ main_width / 2^level)
    pub level: u32,

    /// Index of the IFD in the file's chain
    pub ifd_index: usize,

    /// Image width in pixels at this level
    pub width: u32,

    /// Image height in pixels at this level
    pub height: u32,

    /// Tile width in pixels
    pub tile_width: u32,

    /// Tile height in pixels
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_x: u32,

    /// Number of tiles in Y direction
    pub tiles_y: u32,

    /// Photometric interpretation (drives decoder colour conversion)
    pub photometric: Photometric,

    /// Byte offset of each tile in the file
    pub tile_offsets: Vec<u64>,

    /// Byte count of each tile; 0 marks an empty/background tile
    pub tile_byte_counts: Vec<u64>,

    /// Shared JPEG quantisation/Huffman tables for this level's tiles
    pub jpeg_tables: Option<Bytes>,
}

impl TiffLevel {
    /// Get the tile index for a tile coordinate, or None if out of bounds.
    pub fn tile_index(&self, tile_x: u32, tile_y: u32) -> Option<usize> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        Some((tile_y * self.tiles_x + tile_x) as usize)
    }

    /// Offset and byte count for a tile. A byte count of 0 is an empty tile.
    pub fn tile_location(&self, tile_x: u32, tile_y: u32) -> Option<(u64, u64)> {
        let idx = self.tile_index(tile_x, tile_y)?;
        Some((self.tile_offsets[idx], self.tile_byte_counts[idx]))
    }

    /// Pixel extent of a tile clipped to the image area.
    ///
    /// Edge tiles cover less than `tile_width x tile_height` of real pixels;
    /// the remainder must render transparent.
    pub fn tile_valid_extent(&self, tile_x: u32, tile_y: u32) -> Option<(u32, u32)> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        let w = (self.width - tile_x * self.tile_width).min(self.tile_width);
        let h = (self.height - tile_y * self.tile_height).min(self.tile_height);
        Some((w, h))
    }
}

// =============================================================================
// TiffSlide
// =============================================================================

/// A parsed tiled-JPEG TIFF pyramid with classified IFDs.
#[derive(Debug, Clone)]
pub struct TiffSlide {
    /// The TIFF header
    pub header: TiffHeader,

    /// Pyramid levels sorted by ascending level exponent
    pub levels: Vec<TiffLevel>,

    /// IFD index of the macro image, if present
    pub macro_ifd: Option<usize>,

    /// IFD index of the label image, if present
    pub label_ifd: Option<usize>,

    /// Microns per pixel at level 0, X axis
    pub mpp_x: f64,

    /// Microns per pixel at level 0, Y axis
    pub mpp_y: f64,

    /// True if mpp fell back to [`DEFAULT_MPP_NO_RESOLUTION`]
    mpp_is_default: bool,
}

impl TiffSlide {
    /// Parse a TIFF slide: header, IFD chain, classification, tile tables.
    ///
    /// # Errors
    /// - header errors from [`TiffHeader::parse`]
    /// - `UnsupportedCompression` / `UnsupportedPhotometric` for the main image
    /// - `StripOrganization` if the main image is not tiled
    /// - `InconsistentTileTables` when offsets and byte counts disagree
    pub async fn parse<S: ByteSource>(source: &S) -> Result<Self, TiffError> {
        let header_bytes = source.read_exact_at(0, BIGTIFF_HEADER_SIZE).await?;
        let header = TiffHeader::parse(&header_bytes, source.size())?;

        let ifds = Self::parse_all_ifds(source, &header).await?;
        Self::build(source, header, ifds).await
    }

    /// Parse all IFDs in the file following the next-IFD chain.
    async fn parse_all_ifds<S: ByteSource>(
        source: &S,
        header: &TiffHeader,
    ) -> Result<Vec<Ifd>, TiffError> {
        let mut ifds = Vec::new();
        let mut offset = header.first_ifd_offset;

        while offset != 0 && ifds.len() < MAX_IFDS {
            let count_size = header.ifd_count_size();
            let count_bytes = source.read_exact_at(offset, count_size).await?;

            let entry_count = if header.is_bigtiff {
                header.byte_order.read_u64(&count_bytes)
            } else {
                header.byte_order.read_u16(&count_bytes) as u64
            };

            let ifd_size = Ifd::calculate_size(entry_count, header);
            let ifd_bytes = source.read_exact_at(offset, ifd_size).await?;
            let ifd = Ifd::parse(&ifd_bytes, header)?;

            let next_offset = ifd.next_ifd_offset;
            ifds.push(ifd);

            offset = next_offset;
        }

        Ok(ifds)
    }

    async fn build<S: ByteSource>(
        source: &S,
        header: TiffHeader,
        ifds: Vec<Ifd>,
    ) -> Result<Self, TiffError> {
        if ifds.is_empty() {
            return Err(TiffError::BadIfdOffset(header.first_ifd_offset));
        }

        let value_reader = ValueReader::new(source, &header);

        // The main image fixes the pyramid geometry and must be decodable.
        let main = &ifds[0];
        if main.is_striped() || !main.is_tiled() {
            return Err(TiffError::StripOrganization);
        }
        let main_width = Self::required_u32(&value_reader, main, TiffTag::ImageWidth).await?;

        let compression = Self::required_u32(&value_reader, main, TiffTag::Compression).await? as u16;
        match Compression::from_u16(compression) {
            Some(c) if c.is_supported() => {}
            Some(c) => return Err(TiffError::UnsupportedCompression(c.name().to_string())),
            None => return Err(TiffError::UnsupportedCompression(compression.to_string())),
        }

        let (mpp_x, mpp_y, mpp_is_default) = Self::resolve_mpp(&value_reader, main).await;

        let mut levels: Vec<TiffLevel> = Vec::new();
        let mut macro_ifd = None;
        let mut label_ifd = None;
        let mut last_level = 0u32;

        for (ifd_index, ifd) in ifds.iter().enumerate() {
            let kind = Self::classify(
                &value_reader,
                ifd,
                ifd_index,
                main_width as u64,
                last_level,
            )
            .await?;

            match kind {
                IfdKind::Level(level) => {
                    let tiff_level =
                        Self::load_level(&value_reader, ifd, ifd_index, level).await?;
                    last_level = level;
                    levels.push(tiff_level);
                }
                IfdKind::Macro => macro_ifd = Some(ifd_index),
                IfdKind::Label => label_ifd = Some(ifd_index),
                IfdKind::Unknown => {}
            }
        }

        levels.sort_by_key(|l| l.level);

        Ok(Self {
            header,
            levels,
            macro_ifd,
            label_ifd,
            mpp_x,
            mpp_y,
            mpp_is_default,
        })
    }

    async fn required_u32<S: ByteSource>(
        reader: &ValueReader<'_, S>,
        ifd: &Ifd,
        tag: TiffTag,
    ) -> Result<u32, TiffError> {
        let entry = ifd
            .get_entry_by_tag(tag)
            .ok_or(TiffError::MissingTag(tag_name(tag)))?;
        reader.read_u32(entry).await
    }

    /// Derive microns-per-pixel from the resolution tags.
    ///
    /// Resolution is pixels-per-unit; with the centimetre unit,
    /// `mpp = 10000 / pixels_per_cm`. Missing or non-centimetre resolution
    /// falls back to [`DEFAULT_MPP_NO_RESOLUTION`].
    async fn resolve_mpp<S: ByteSource>(
        reader: &ValueReader<'_, S>,
        ifd: &Ifd,
    ) -> (f64, f64, bool) {
        let unit = match ifd.get_entry_by_tag(TiffTag::ResolutionUnit) {
            Some(e) => e.inline_u32(reader.byte_order()).unwrap_or(0) as u16,
            None => 0,
        };

        if unit == RESOLUTION_UNIT_CENTIMETER {
            let x = Self::rational_mpp(reader, ifd, TiffTag::XResolution).await;
            let y = Self::rational_mpp(reader, ifd, TiffTag::YResolution).await;
            if let (Some(x), Some(y)) = (x, y) {
                return (x, y, false);
            }
        }

        (
            DEFAULT_MPP_NO_RESOLUTION,
            DEFAULT_MPP_NO_RESOLUTION,
            true,
        )
    }

    async fn rational_mpp<S: ByteSource>(
        reader: &ValueReader<'_, S>,
        ifd: &Ifd,
        tag: TiffTag,
    ) -> Option<f64> {
        let entry = ifd.get_entry_by_tag(tag)?;
        let (num, den) = reader.read_rational(entry).await.ok()?;
        if num == 0 || den == 0 {
            return None;
        }
        let pixels_per_cm = num as f64 / den as f64;
        Some(10_000.0 / pixels_per_cm)
    }

    async fn classify<S: ByteSource>(
        reader: &ValueReader<'_, S>,
        ifd: &Ifd,
        ifd_index: usize,
        main_width: u64,
        last_level: u32,
    ) -> Result<IfdKind, TiffError> {
        // Macro/label images identify themselves by description prefix.
        if let Some(entry) = ifd.get_entry_by_tag(TiffTag::ImageDescription) {
            if let Ok(description) = reader.read_string(entry).await {
                if description.starts_with("Macro") {
                    return Ok(IfdKind::Macro);
                }
                if description.starts_with("Label") {
                    return Ok(IfdKind::Label);
                }
            }
        }

        if !ifd.is_tiled() {
            return Ok(IfdKind::Unknown);
        }

        if ifd_index == 0 {
            return Ok(IfdKind::Level(0));
        }

        let bo = reader.byte_order();
        let (width, tile_width) = match (ifd.image_width(bo), ifd.tile_width(bo)) {
            (Some(w), Some(tw)) if w > 0 && tw > 0 => (w, tw),
            _ => return Ok(IfdKind::Unknown),
        };
        let tiles_x = width.div_ceil(tile_width);

        Ok(IfdKind::Level(deduce_downsample_level(
            main_width, width, tiles_x, tile_width, last_level,
        )))
    }

    async fn load_level<S: ByteSource>(
        reader: &ValueReader<'_, S>,
        ifd: &Ifd,
        ifd_index: usize,
        level: u32,
    ) -> Result<TiffLevel, TiffError> {
        let bo = reader.byte_order();

        let width = Self::required_u32(reader, ifd, TiffTag::ImageWidth).await?;
        let height = Self::required_u32(reader, ifd, TiffTag::ImageLength).await?;
        let tile_width = Self::required_u32(reader, ifd, TiffTag::TileWidth).await?;
        let tile_height = Self::required_u32(reader, ifd, TiffTag::TileLength).await?;

        let photometric_code = ifd.photometric(bo).unwrap_or(Photometric::YCbCr as u16);
        let photometric = Photometric::from_u16(photometric_code)
            .ok_or(TiffError::UnsupportedPhotometric(photometric_code))?;

        let tiles_x = width.div_ceil(tile_width);
        let tiles_y = height.div_ceil(tile_height);

        let offsets_entry = ifd
            .get_entry_by_tag(TiffTag::TileOffsets)
            .ok_or(TiffError::MissingTag("TileOffsets"))?;
        let byte_counts_entry = ifd
            .get_entry_by_tag(TiffTag::TileByteCounts)
            .ok_or(TiffError::MissingTag("TileByteCounts"))?;

        let tile_offsets = reader.read_u64_array(offsets_entry).await?;
        let tile_byte_counts = reader.read_u64_array(byte_counts_entry).await?;

        let expected = (tiles_x * tiles_y) as usize;
        if tile_offsets.len() != expected || tile_byte_counts.len() != expected {
            return Err(TiffError::InconsistentTileTables {
                offsets: tile_offsets.len(),
                byte_counts: tile_byte_counts.len(),
            });
        }

        let jpeg_tables = match ifd.get_entry_by_tag(TiffTag::JpegTables) {
            Some(entry) => Some(reader.read_raw_bytes(entry).await?),
            None => None,
        };

        Ok(TiffLevel {
            level,
            ifd_index,
            width,
            height,
            tile_width,
            tile_height,
            tiles_x,
            tiles_y,
            photometric,
            tile_offsets,
            tile_byte_counts,
            jpeg_tables,
        })
    }

    /// Assemble a slide from already-parsed parts.
    ///
    /// Used by the wire-metadata parser, where the geometry arrives
    /// pre-classified from the server.
    pub fn from_parts(
        header: TiffHeader,
        levels: Vec<TiffLevel>,
        mpp_x: f64,
        mpp_y: f64,
        mpp_is_default: bool,
    ) -> Self {
        Self {
            header,
            levels,
            macro_ifd: None,
            label_ifd: None,
            mpp_x,
            mpp_y,
            mpp_is_default,
        }
    }

    /// Number of discrete levels spanned (highest level exponent + 1).
    pub fn level_count(&self) -> u32 {
        self.levels.last().map(|l| l.level + 1).unwrap_or(0)
    }

    /// Find the level with the given discrete exponent.
    pub fn level(&self, level: u32) -> Option<&TiffLevel> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Dimensions of the main image.
    pub fn dimensions(&self) -> (u32, u32) {
        self.levels
            .first()
            .map(|l| (l.width, l.height))
            .unwrap_or((0, 0))
    }

    /// True if mpp fell back to the scanner-typical default.
    pub fn mpp_is_default(&self) -> bool {
        self.mpp_is_default
    }
}

/// Assign a discrete downsample level to an IFD.
///
/// The raw ratio `main_width / width` is inexact because level dimensions are
/// rounded up to a tile multiple; the tile-count constraint bounds the true
/// width, and the unique exponent whose main-width projection falls inside
/// those bounds wins. If zero or several candidates fit, fall back to
/// `last_level + 1`.
pub fn deduce_downsample_level(
    main_width: u64,
    width: u32,
    tiles_x: u32,
    tile_width: u32,
    last_level: u32,
) -> u32 {
    // True width bounds from the tile count
    let lo = (tiles_x.saturating_sub(1) as u64) * tile_width as u64 + 1;
    let hi = tiles_x as u64 * tile_width as u64;

    let candidates: Vec<u32> = (0..MAX_LEVEL_COUNT)
        .filter(|&level| {
            let projected = main_width >> level;
            projected >= lo && projected <= hi
        })
        .collect();

    match candidates.as_slice() {
        [level] => return *level,
        [] => {
            // No level projects into the bounds (unusual rounding); try
            // the exact ratio before giving up.
            let ratio = main_width as f64 / width as f64;
            let rounded = ratio.log2().round();
            if rounded >= 0.0 && (rounded as u32) < MAX_LEVEL_COUNT {
                let exact = (1u64 << rounded as u32) as f64;
                if (ratio / exact - 1.0).abs() < 0.05 {
                    return rounded as u32;
                }
            }
        }
        _ => {} // several levels fit: ambiguous
    }

    warn!(
        main_width,
        width,
        tiles_x,
        tile_width,
        fallback = last_level + 1,
        "ambiguous downsample level; falling back to last_level + 1"
    );
    last_level + 1
}

fn tag_name(tag: TiffTag) -> &'static str {
    match tag {
        TiffTag::ImageWidth => "ImageWidth",
        TiffTag::ImageLength => "ImageLength",
        TiffTag::TileWidth => "TileWidth",
        TiffTag::TileLength => "TileLength",
        TiffTag::TileOffsets => "TileOffsets",
        TiffTag::TileByteCounts => "TileByteCounts",
        TiffTag::Compression => "Compression",
        _ => "tag",
    }
}

// =============================================================================
// Tests
// =============================================================================
