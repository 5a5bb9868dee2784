//! iSyntax container structure: code-block headers, seek table, chunks.
//!
//! After the XML header the file is a flat binary payload of Hulsken
//! code-blocks. The XML's block-header table describes every block; two
//! encodings exist:
//!
//! - **partial** (48-byte records): coordinates only; file offset and size
//!   live in a separate *seek table* that directly follows the XML
//!   terminator, indexed by a computed `block_id`
//! - **full** (80-byte records): offset and size inline
//!
//! Code-blocks are grouped into I/O *chunks* spanning up to three scales
//! (`scale`, `scale-1`, `scale-2`) and all three colours; a chunk starts at
//! a code-block whose scale is the top scale or satisfies `scale % 3 == 2`.
//! Reading any tile pulls in its whole chunk with a single range read.

use crate::error::IsyntaxError;
use crate::io::ByteSource;

use super::xml::XmlImage;

/// DICOM tag header: u16 group, u16 element, u32 size.
pub const DICOM_TAG_HEADER_SIZE: usize = 8;

/// Partial block-header record size.
pub const PARTIAL_BLOCK_HEADER_SIZE: usize = 48;

/// Full block-header record size.
pub const FULL_BLOCK_HEADER_SIZE: usize = 80;

/// Seek table entry: three tag headers plus offset and size.
pub const SEEKTABLE_ENTRY_SIZE: usize = 40;

/// Per-level padding constant of the code-block coordinate grid.
pub const PER_LEVEL_PADDING: i32 = 3;

// =============================================================================
// Codeblock
// =============================================================================

/// One wavelet coefficient code-block.
#[derive(Debug, Clone, Default)]
pub struct Codeblock {
    /// Raw grid coordinates from the header (before origin adjustment)
    pub x_coordinate: u32,
    pub y_coordinate: u32,
    /// YCoCg channel: 0 = Y, 1 = Co, 2 = Cg
    pub color_component: u32,
    /// Pyramid scale this block belongs to
    pub scale: u32,
    /// 0 = LL block, 1 = H composite (HL/LH/HH)
    pub coefficient: u32,
    /// File offset of the compressed payload
    pub block_data_offset: u64,
    /// Compressed payload size; <= 8 marks an empty/background block
    pub block_size: u64,
    /// Header template describing the block geometry
    pub block_header_template_id: u32,
    /// Tile-grid position at this scale (after origin adjustment)
    pub block_x: u32,
    pub block_y: u32,
    /// Index into the seek table
    pub block_id: u32,
}

/// An I/O chunk of consecutive code-blocks read with one range request.
#[derive(Debug, Clone, Copy)]
pub struct DataChunk {
    /// File offset of the first code-block in the chunk
    pub offset: u64,
    /// Index of the chunk's first code-block in the codeblock array
    pub top_codeblock_index: usize,
    /// Code-blocks per colour in this chunk (1, 1+4, 1+4+16, +1 LL at top)
    pub codeblock_count_per_color: u32,
    /// Scale of the chunk's top code-block
    pub scale: u32,
}

impl DataChunk {
    /// Number of pyramid levels the chunk carries.
    pub fn levels_in_chunk(&self) -> u32 {
        self.scale % 3 + 1
    }
}

/// Per-level tile grid geometry.
#[derive(Debug, Clone, Copy)]
pub struct LevelGrid {
    pub scale: u32,
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub tile_count: u32,
}

/// Per-tile lookup data established at open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TileRef {
    /// False for background tiles with no code-block in the file
    pub exists: bool,
    /// The tile's own H code-block
    pub codeblock_index: usize,
    /// First code-block of the owning chunk
    pub chunk_codeblock_index: usize,
    /// The owning chunk
    pub chunk_index: usize,
}

// =============================================================================
// Container
// =============================================================================

/// Parsed iSyntax WSI structure: geometry, code-blocks, chunks, tile maps.
pub struct IsyntaxContainer {
    /// Code-block dimensions (from the first header template)
    pub block_width: u32,
    pub block_height: u32,
    /// Reconstructed tile dimensions (doubled by the inverse transform)
    pub tile_width: u32,
    pub tile_height: u32,
    /// Full-resolution pixel dimensions
    pub width: u32,
    pub height: u32,
    /// Level count; `max_scale = level_count - 1`
    pub level_count: u32,
    pub max_scale: u32,
    pub codeblocks: Vec<Codeblock>,
    pub chunks: Vec<DataChunk>,
    pub levels: Vec<LevelGrid>,
    /// Per level, `width_in_tiles * height_in_tiles` tile refs
    pub tiles: Vec<Vec<TileRef>>,
}

/// Number of code-blocks per colour in a chunk whose top is at `scale`.
///
/// A chunk carries `scale % 3 + 1` levels: 1, then 4, then 16 blocks going
/// down; the pyramid-top chunk adds one LL block.
pub fn chunk_codeblocks_per_color(scale: u32, has_ll: bool) -> u32 {
    let count = match scale % 3 {
        0 => 1,
        1 => 1 + 4,
        _ => 1 + 4 + 16,
    };
    if has_ll {
        count + 1
    } else {
        count
    }
}

/// Coordinate-grid offset of the first valid H coefficient at a scale.
#[inline]
pub fn first_valid_coef_pixel(scale: u32) -> i32 {
    (PER_LEVEL_PADDING << scale) - (PER_LEVEL_PADDING - 1)
}

/// Coordinate-grid offset of the first valid LL coefficient at a scale.
#[inline]
pub fn first_valid_ll_pixel(scale: u32) -> i32 {
    first_valid_coef_pixel(scale) + (1 << scale)
}

impl IsyntaxContainer {
    /// Build the container from the parsed XML image plus the binary
    /// payload. `data_offset` is the file position just past the XML
    /// terminator, where the seek table lives when headers are partial.
    pub async fn open<S: ByteSource>(
        source: &S,
        image: &XmlImage,
        block_width: u32,
        block_height: u32,
        data_offset: u64,
    ) -> Result<Self, IsyntaxError> {
        if block_width == 0 || block_height == 0 {
            return Err(IsyntaxError::MalformedXml(
                "header template has zero block dimensions".to_string(),
            ));
        }
        if image.level_count == 0 || image.width == 0 || image.height == 0 {
            return Err(IsyntaxError::MalformedXml(
                "WSI image has no geometry".to_string(),
            ));
        }

        let (mut codeblocks, headers_are_partial) =
            parse_block_header_table(&image.block_header_table)?;

        if let Some(bad) = codeblocks
            .iter()
            .find(|c| c.scale >= image.level_count || c.color_component > 2)
        {
            return Err(IsyntaxError::MalformedXml(format!(
                "code-block at scale {} colour {} outside the declared pyramid",
                bad.scale, bad.color_component
            )));
        }

        let tile_width = block_width * 2;
        let tile_height = block_height * 2;
        let num_levels = image.level_count;
        let max_scale = num_levels - 1;

        // The code-block grid is aligned to the coarsest level's tiling.
        let grid_width = (image.width as u64)
            .div_ceil((block_width as u64) << num_levels)
            << (num_levels - 1);
        let grid_height = (image.height as u64)
            .div_ceil((block_height as u64) << num_levels)
            << (num_levels - 1);

        let base_tile_count = grid_width * grid_height;
        let mut levels = Vec::with_capacity(num_levels as usize);
        let mut h_coeff_tile_count = 0u64;
        for scale in 0..num_levels {
            let tile_count = base_tile_count >> (scale * 2);
            h_coeff_tile_count += tile_count;
            levels.push(LevelGrid {
                scale,
                width_in_tiles: (grid_width >> scale) as u32,
                height_in_tiles: (grid_height >> scale) as u32,
                tile_count: tile_count as u32,
            });
        }
        // The top scale also stores LL blocks
        let ll_coeff_tile_count = base_tile_count >> (max_scale * 2);
        let tiles_per_color = h_coeff_tile_count + ll_coeff_tile_count;

        // Assign grid positions and seek-table ids
        for codeblock in codeblocks.iter_mut() {
            let is_ll = codeblock.coefficient == 0;
            let id_scale = if is_ll {
                codeblock.scale + 1
            } else {
                codeblock.scale
            };

            let mut block_id = 0u64;
            for level in levels.iter().take(id_scale.min(num_levels) as usize) {
                block_id += level.tile_count as u64;
            }

            let grid_offset = if is_ll {
                first_valid_ll_pixel(codeblock.scale)
            } else {
                first_valid_coef_pixel(codeblock.scale)
            };
            let x = codeblock.x_coordinate as i64 - image.offset_x as i64 - grid_offset as i64;
            let y = codeblock.y_coordinate as i64 - image.offset_y as i64 - grid_offset as i64;
            let tile_span = (tile_width as i64) << codeblock.scale;
            codeblock.block_x = (x / tile_span).max(0) as u32;
            codeblock.block_y = (y / ((tile_height as i64) << codeblock.scale)).max(0) as u32;

            let grid_stride = grid_width >> codeblock.scale;
            block_id += codeblock.block_y as u64 * grid_stride + codeblock.block_x as u64;
            block_id += codeblock.color_component as u64 * tiles_per_color;
            codeblock.block_id = block_id as u32;
        }

        if headers_are_partial {
            resolve_seektable(source, &mut codeblocks, data_offset).await?;
        }

        // Group code-blocks into chunks and map tiles onto them
        let mut tiles: Vec<Vec<TileRef>> = levels
            .iter()
            .map(|l| vec![TileRef::default(); l.tile_count as usize])
            .collect();

        let mut chunks = Vec::new();
        let mut current_chunk_codeblock_index = 0usize;
        let mut next_chunk_codeblock_index = 0usize;

        let mut i = 0usize;
        while i < codeblocks.len() {
            if codeblocks[i].color_component != 0 && i != next_chunk_codeblock_index {
                // Colour channels 1 and 2 repeat the same tile layout;
                // skip to the next chunk boundary.
                i = next_chunk_codeblock_index;
                if i >= codeblocks.len() {
                    break;
                }
            }

            if i == next_chunk_codeblock_index {
                let scale = codeblocks[i].scale;
                let per_color = chunk_codeblocks_per_color(scale, scale == max_scale);
                current_chunk_codeblock_index = i;
                next_chunk_codeblock_index = i + (per_color as usize) * 3;

                chunks.push(DataChunk {
                    offset: codeblocks[i].block_data_offset,
                    top_codeblock_index: i,
                    codeblock_count_per_color: per_color,
                    scale,
                });
            }

            let codeblock = &codeblocks[i];
            let level = &levels[codeblock.scale as usize];
            let tile_index =
                (codeblock.block_y * level.width_in_tiles + codeblock.block_x) as usize;
            if tile_index < tiles[codeblock.scale as usize].len() {
                tiles[codeblock.scale as usize][tile_index] = TileRef {
                    exists: true,
                    codeblock_index: i,
                    chunk_codeblock_index: current_chunk_codeblock_index,
                    chunk_index: chunks.len() - 1,
                };
            }

            i += 1;
        }

        Ok(Self {
            block_width,
            block_height,
            tile_width,
            tile_height,
            width: image.width,
            height: image.height,
            level_count: num_levels,
            max_scale,
            codeblocks,
            chunks,
            levels,
            tiles,
        })
    }

    /// Tile lookup at a scale; `None` when the coordinate is off-grid.
    pub fn tile_ref(&self, scale: u32, tile_x: u32, tile_y: u32) -> Option<TileRef> {
        let level = self.levels.get(scale as usize)?;
        if tile_x >= level.width_in_tiles || tile_y >= level.height_in_tiles {
            return None;
        }
        let index = (tile_y * level.width_in_tiles + tile_x) as usize;
        self.tiles[scale as usize].get(index).copied()
    }

    /// Byte range covering a whole chunk (for one range read).
    pub fn chunk_range(&self, chunk: &DataChunk) -> (u64, usize) {
        let count = (chunk.codeblock_count_per_color as usize) * 3;
        let last_index = (chunk.top_codeblock_index + count - 1).min(self.codeblocks.len() - 1);
        let last = &self.codeblocks[last_index];
        let end = last.block_data_offset + last.block_size;
        (chunk.offset, end.saturating_sub(chunk.offset) as usize)
    }
}

// =============================================================================
// Block header table
// =============================================================================

/// Parse the decoded block-header table. Returns the blocks and whether the
/// records were partial (seek table required).
pub fn parse_block_header_table(
    table: &[u8],
) -> Result<(Vec<Codeblock>, bool), IsyntaxError> {
    if table.len() < 4 + DICOM_TAG_HEADER_SIZE {
        return Err(IsyntaxError::TruncatedHeaderTable {
            got: table.len(),
            record: PARTIAL_BLOCK_HEADER_SIZE,
        });
    }

    let header_size = u32::from_le_bytes(table[0..4].try_into().unwrap()) as usize;
    let records = &table[4..];

    // The sequence element size distinguishes the two record layouts:
    // 40 payload bytes = partial (48 total), 72 = full (80 total).
    let sequence_size = u32::from_le_bytes(records[4..8].try_into().unwrap());
    let (record_size, partial) = match sequence_size {
        40 => (PARTIAL_BLOCK_HEADER_SIZE, true),
        72 => (FULL_BLOCK_HEADER_SIZE, false),
        other => {
            return Err(IsyntaxError::MalformedXml(format!(
                "unrecognised block header sequence size {other}"
            )))
        }
    };

    if header_size % record_size != 0 || records.len() < header_size {
        return Err(IsyntaxError::TruncatedHeaderTable {
            got: records.len(),
            record: record_size,
        });
    }
    let block_count = header_size / record_size;

    let mut codeblocks = Vec::with_capacity(block_count);
    for i in 0..block_count {
        let r = &records[i * record_size..(i + 1) * record_size];
        let read_u32 = |at: usize| u32::from_le_bytes(r[at..at + 4].try_into().unwrap());
        let read_u64 = |at: usize| u64::from_le_bytes(r[at..at + 8].try_into().unwrap());

        let mut codeblock = Codeblock {
            x_coordinate: read_u32(16),
            y_coordinate: read_u32(20),
            color_component: read_u32(24),
            scale: read_u32(28),
            coefficient: read_u32(32),
            ..Codeblock::default()
        };

        if partial {
            codeblock.block_header_template_id = read_u32(44);
        } else {
            codeblock.block_data_offset = read_u64(44);
            codeblock.block_size = read_u64(60);
            codeblock.block_header_template_id = read_u32(76);
        }

        codeblocks.push(codeblock);
    }

    Ok((codeblocks, partial))
}

// =============================================================================
// Seek table
// =============================================================================

/// Fill in offsets and sizes from the seek table at `data_offset`.
///
/// The table holds one 40-byte `(offset, size)` entry per *possible*
/// code-block, indexed by `block_id`; entries for blocks absent from the
/// file carry zeros.
async fn resolve_seektable<S: ByteSource>(
    source: &S,
    codeblocks: &mut [Codeblock],
    data_offset: u64,
) -> Result<(), IsyntaxError> {
    let tag = source.read_exact_at(data_offset, DICOM_TAG_HEADER_SIZE).await?;
    let group = u16::from_le_bytes([tag[0], tag[1]]);
    let element = u16::from_le_bytes([tag[2], tag[3]]);
    let size = i32::from_le_bytes([tag[4], tag[5], tag[6], tag[7]]);

    if group != 0x301D || element != 0x2015 {
        return Err(IsyntaxError::MalformedSeektable(format!(
            "expected tag (0x301D, 0x2015), found (0x{group:04X}, 0x{element:04X})"
        )));
    }

    // Some writers leave the size field undefined; fall back to one entry
    // per known code-block.
    let table_size = if size > 0 {
        size as usize
    } else {
        codeblocks.len() * SEEKTABLE_ENTRY_SIZE
    };

    let table = source
        .read_exact_at(data_offset + DICOM_TAG_HEADER_SIZE as u64, table_size)
        .await?;
    let entry_count = table.len() / SEEKTABLE_ENTRY_SIZE;

    for codeblock in codeblocks.iter_mut() {
        let id = codeblock.block_id as usize;
        if id >= entry_count {
            return Err(IsyntaxError::MalformedSeektable(format!(
                "block id {id} out of bounds ({entry_count} entries)"
            )));
        }
        let entry = &table[id * SEEKTABLE_ENTRY_SIZE..(id + 1) * SEEKTABLE_ENTRY_SIZE];

        // Validate the inner offset tag before trusting the entry
        let entry_group = u16::from_le_bytes([entry[8], entry[9]]);
        let entry_element = u16::from_le_bytes([entry[10], entry[11]]);
        if entry_group != 0x301D || entry_element != 0x2010 {
            return Err(IsyntaxError::MalformedSeektable(format!(
                "entry {id} has tag (0x{entry_group:04X}, 0x{entry_element:04X})"
            )));
        }

        codeblock.block_data_offset =
            u64::from_le_bytes(entry[16..24].try_into().unwrap());
        codeblock.block_size = u64::from_le_bytes(entry[32..40].try_into().unwrap());
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Chunk geometry helpers
    // -------------------------------------------------------------------------

    #[test]
    fn test_chunk_codeblocks_per_color() {
        // scale % 3 == 0: 1 block; == 1: 5; == 2: 21
        assert_eq!(chunk_codeblocks_per_color(0, false), 1);
        assert_eq!(chunk_codeblocks_per_color(1, false), 5);
        assert_eq!(chunk_codeblocks_per_color(2, false), 21);
        assert_eq!(chunk_codeblocks_per_color(5, false), 21);
        // Top of pyramid adds the LL block: 21 + 1 at scale 8
        assert_eq!(chunk_codeblocks_per_color(8, true), 22);
    }

    #[test]
    fn test_first_valid_pixel_offsets() {
        assert_eq!(first_valid_coef_pixel(0), 1);
        assert_eq!(first_valid_coef_pixel(1), 4);
        assert_eq!(first_valid_coef_pixel(2), 10);
        assert_eq!(first_valid_ll_pixel(0), 2);
        assert_eq!(first_valid_ll_pixel(2), 14);
    }

    #[test]
    fn test_levels_in_chunk() {
        let chunk = |scale| DataChunk {
            offset: 0,
            top_codeblock_index: 0,
            codeblock_count_per_color: 0,
            scale,
        };
        assert_eq!(chunk(8).levels_in_chunk(), 3); // scales 8, 7, 6
        assert_eq!(chunk(7).levels_in_chunk(), 2); // scales 7, 6
        assert_eq!(chunk(6).levels_in_chunk(), 1); // scale 6 only
        assert_eq!(chunk(5).levels_in_chunk(), 3); // scales 5, 4, 3
    }

    // -------------------------------------------------------------------------
    // Block header table parsing
    // -------------------------------------------------------------------------

    fn dicom_header(group: u16, element: u16, size: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&element.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    fn partial_record(x: u32, y: u32, color: u32, scale: u32, coeff: u32) -> Vec<u8> {
        let mut r = Vec::with_capacity(PARTIAL_BLOCK_HEADER_SIZE);
        r.extend_from_slice(&dicom_header(0x301D, 0x2020, 40));
        r.extend_from_slice(&dicom_header(0x301D, 0x2021, 20));
        r.extend_from_slice(&x.to_le_bytes());
        r.extend_from_slice(&y.to_le_bytes());
        r.extend_from_slice(&color.to_le_bytes());
        r.extend_from_slice(&scale.to_le_bytes());
        r.extend_from_slice(&coeff.to_le_bytes());
        r.extend_from_slice(&dicom_header(0x301D, 0x2022, 4));
        r.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(r.len(), PARTIAL_BLOCK_HEADER_SIZE);
        r
    }

    fn full_record(
        x: u32,
        y: u32,
        color: u32,
        scale: u32,
        coeff: u32,
        offset: u64,
        size: u64,
    ) -> Vec<u8> {
        let mut r = Vec::with_capacity(FULL_BLOCK_HEADER_SIZE);
        r.extend_from_slice(&dicom_header(0x301D, 0x2020, 72));
        r.extend_from_slice(&dicom_header(0x301D, 0x2021, 20));
        r.extend_from_slice(&x.to_le_bytes());
        r.extend_from_slice(&y.to_le_bytes());
        r.extend_from_slice(&color.to_le_bytes());
        r.extend_from_slice(&scale.to_le_bytes());
        r.extend_from_slice(&coeff.to_le_bytes());
        r.extend_from_slice(&dicom_header(0x301D, 0x2010, 8));
        r.extend_from_slice(&offset.to_le_bytes());
        r.extend_from_slice(&dicom_header(0x301D, 0x2011, 8));
        r.extend_from_slice(&size.to_le_bytes());
        r.extend_from_slice(&dicom_header(0x301D, 0x2022, 4));
        r.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(r.len(), FULL_BLOCK_HEADER_SIZE);
        r
    }

    fn table_from_records(records: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = records.concat();
        let mut table = Vec::new();
        table.extend_from_slice(&(body.len() as u32).to_le_bytes());
        table.extend_from_slice(&body);
        table
    }

    #[test]
    fn test_parse_partial_block_headers() {
        let table = table_from_records(&[
            partial_record(100, 200, 0, 8, 0),
            partial_record(100, 200, 0, 8, 1),
        ]);

        let (blocks, partial) = parse_block_header_table(&table).unwrap();
        assert!(partial);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].x_coordinate, 100);
        assert_eq!(blocks[0].coefficient, 0);
        assert_eq!(blocks[1].coefficient, 1);
        // Partial records carry no offsets
        assert_eq!(blocks[0].block_data_offset, 0);
    }

    #[test]
    fn test_parse_full_block_headers() {
        let table = table_from_records(&[full_record(10, 20, 1, 3, 1, 0xDEAD, 4096)]);

        let (blocks, partial) = parse_block_header_table(&table).unwrap();
        assert!(!partial);
        assert_eq!(blocks[0].block_data_offset, 0xDEAD);
        assert_eq!(blocks[0].block_size, 4096);
        assert_eq!(blocks[0].color_component, 1);
        assert_eq!(blocks[0].scale, 3);
    }

    #[test]
    fn test_truncated_table_rejected() {
        let mut table = table_from_records(&[partial_record(0, 0, 0, 0, 0)]);
        table.truncate(table.len() - 10);
        let result = parse_block_header_table(&table);
        assert!(matches!(
            result,
            Err(IsyntaxError::TruncatedHeaderTable { .. })
        ));
    }

    #[test]
    fn test_unknown_sequence_size_rejected() {
        let mut record = partial_record(0, 0, 0, 0, 0);
        record[4..8].copy_from_slice(&99u32.to_le_bytes());
        let table = table_from_records(&[record]);
        let result = parse_block_header_table(&table);
        assert!(matches!(result, Err(IsyntaxError::MalformedXml(_))));
    }
}
