//! Serialised TIFF metadata for the remote wire protocol.
//!
//! A remote slide server answers `/slide/<name>/header` with the parsed TIFF
//! metadata in a typed-block stream, so the client never has to walk the IFD
//! chain over the network. The stream is a sequence of blocks:
//!
//! ```text
//! block header: u32 block_type | u32 index | u64 length   (16 bytes, LE)
//! payload:      `length` bytes
//! ```
//!
//! Per-level blocks carry the level index in `index`. The whole stream may be
//! wrapped in a single `LZ4_COMPRESSED_DATA` block whose `index` field holds
//! the uncompressed size.

use bytes::Bytes;

use crate::error::TiffError;

use super::parser::{ByteOrder, TiffHeader};
use super::pyramid::{TiffLevel, TiffSlide};
use super::tags::Photometric;

// =============================================================================
// Block Types
// =============================================================================

/// File-level metadata record (geometry, byte order, mpp)
pub const BLOCK_TIFF_HEADER_AND_META: u32 = 9001;

/// Per-level fixed-size IFD record
pub const BLOCK_TIFF_IFDS: u32 = 9002;

/// Per-level image description string
pub const BLOCK_TIFF_IMAGE_DESCRIPTION: u32 = 9003;

/// Per-level tile offset array (u64 LE)
pub const BLOCK_TIFF_TILE_OFFSETS: u32 = 9004;

/// Per-level tile byte count array (u64 LE)
pub const BLOCK_TIFF_TILE_BYTE_COUNTS: u32 = 9005;

/// Per-level shared JPEG tables blob
pub const BLOCK_TIFF_JPEG_TABLES: u32 = 9006;

/// LZ4-compressed wrapper around a whole stream; `index` = uncompressed size
pub const BLOCK_LZ4_COMPRESSED_DATA: u32 = 4444;

/// End of stream
pub const BLOCK_TERMINATOR: u32 = 800;

/// Size of a serialised block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Fixed payload size of the header-and-meta record.
const HEADER_META_SIZE: usize = 32;

/// Fixed payload size of a per-level IFD record.
const IFD_RECORD_SIZE: usize = 32;

// =============================================================================
// Serialisation
// =============================================================================

fn push_block_header(out: &mut Vec<u8>, block_type: u32, index: u32, length: u64) {
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
}

/// Serialise slide metadata into an uncompressed block stream.
pub fn serialize_metadata(slide: &TiffSlide) -> Vec<u8> {
    let mut out = Vec::new();

    // Header-and-meta record
    push_block_header(
        &mut out,
        BLOCK_TIFF_HEADER_AND_META,
        0,
        HEADER_META_SIZE as u64,
    );
    out.push(slide.header.is_bigtiff as u8);
    out.push(match slide.header.byte_order {
        ByteOrder::LittleEndian => 0u8,
        ByteOrder::BigEndian => 1u8,
    });
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&(slide.levels.len() as u32).to_le_bytes());
    out.extend_from_slice(&slide.mpp_x.to_le_bytes());
    out.extend_from_slice(&slide.mpp_y.to_le_bytes());
    out.extend_from_slice(&(slide.mpp_is_default() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);

    // Per-level blocks
    for (i, level) in slide.levels.iter().enumerate() {
        let index = i as u32;

        push_block_header(&mut out, BLOCK_TIFF_IFDS, index, IFD_RECORD_SIZE as u64);
        out.extend_from_slice(&level.level.to_le_bytes());
        out.extend_from_slice(&level.width.to_le_bytes());
        out.extend_from_slice(&level.height.to_le_bytes());
        out.extend_from_slice(&level.tile_width.to_le_bytes());
        out.extend_from_slice(&level.tile_height.to_le_bytes());
        out.extend_from_slice(&level.tiles_x.to_le_bytes());
        out.extend_from_slice(&level.tiles_y.to_le_bytes());
        out.extend_from_slice(&(level.photometric as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);

        push_block_header(
            &mut out,
            BLOCK_TIFF_TILE_OFFSETS,
            index,
            (level.tile_offsets.len() * 8) as u64,
        );
        for &offset in &level.tile_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }

        push_block_header(
            &mut out,
            BLOCK_TIFF_TILE_BYTE_COUNTS,
            index,
            (level.tile_byte_counts.len() * 8) as u64,
        );
        for &count in &level.tile_byte_counts {
            out.extend_from_slice(&count.to_le_bytes());
        }

        if let Some(ref tables) = level.jpeg_tables {
            push_block_header(&mut out, BLOCK_TIFF_JPEG_TABLES, index, tables.len() as u64);
            out.extend_from_slice(tables);
        }
    }

    push_block_header(&mut out, BLOCK_TERMINATOR, 0, 0);

    out
}

/// Serialise slide metadata and wrap it in an LZ4 block.
pub fn serialize_metadata_compressed(slide: &TiffSlide) -> Vec<u8> {
    let raw = serialize_metadata(slide);
    let compressed = lz4_flex::compress(&raw);

    let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE + compressed.len());
    push_block_header(
        &mut out,
        BLOCK_LZ4_COMPRESSED_DATA,
        raw.len() as u32,
        compressed.len() as u64,
    );
    out.extend_from_slice(&compressed);
    out
}

// =============================================================================
// Parsing
// =============================================================================

struct BlockCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

struct RawBlock<'a> {
    block_type: u32,
    index: u32,
    payload: &'a [u8],
}

impl<'a> BlockCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn next_block(&mut self) -> Result<RawBlock<'a>, TiffError> {
        if self.pos + BLOCK_HEADER_SIZE > self.data.len() {
            return Err(TiffError::BadMetadataStream(
                "stream ended inside a block header".to_string(),
            ));
        }
        let header = &self.data[self.pos..self.pos + BLOCK_HEADER_SIZE];
        let block_type = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let index = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let length = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;

        let start = self.pos + BLOCK_HEADER_SIZE;
        if start + length > self.data.len() {
            return Err(TiffError::BadMetadataStream(format!(
                "block {block_type} claims {length} bytes past end of stream"
            )));
        }
        self.pos = start + length;

        Ok(RawBlock {
            block_type,
            index,
            payload: &self.data[start..start + length],
        })
    }
}

#[derive(Default)]
struct LevelAccumulator {
    record: Option<[u8; IFD_RECORD_SIZE]>,
    tile_offsets: Vec<u64>,
    tile_byte_counts: Vec<u64>,
    jpeg_tables: Option<Bytes>,
}

/// Parse a serialised metadata stream back into a [`TiffSlide`].
///
/// An LZ4 wrapper block is unwrapped transparently. Serialising an opened
/// slide and parsing the result reproduces its geometry, tile tables and
/// JPEG tables exactly.
pub fn parse_metadata(data: &[u8]) -> Result<TiffSlide, TiffError> {
    // Unwrap an optional LZ4 envelope first
    if data.len() >= BLOCK_HEADER_SIZE {
        let block_type = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if block_type == BLOCK_LZ4_COMPRESSED_DATA {
            let uncompressed_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            let length = u64::from_le_bytes(data[8..16].try_into().unwrap()) as usize;
            if BLOCK_HEADER_SIZE + length > data.len() {
                return Err(TiffError::BadMetadataStream(
                    "LZ4 block truncated".to_string(),
                ));
            }
            let compressed = &data[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + length];
            let decompressed = lz4_flex::decompress(compressed, uncompressed_size)
                .map_err(|e| TiffError::BadMetadataStream(format!("LZ4: {e}")))?;
            return parse_metadata(&decompressed);
        }
    }

    let mut cursor = BlockCursor::new(data);

    // Header-and-meta must come first
    let meta = cursor.next_block()?;
    if meta.block_type != BLOCK_TIFF_HEADER_AND_META || meta.payload.len() < HEADER_META_SIZE {
        return Err(TiffError::BadMetadataStream(format!(
            "expected header block, got type {}",
            meta.block_type
        )));
    }
    let is_bigtiff = meta.payload[0] != 0;
    let byte_order = if meta.payload[1] == 0 {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    };
    let level_count = u32::from_le_bytes(meta.payload[4..8].try_into().unwrap()) as usize;
    let mpp_x = f64::from_le_bytes(meta.payload[8..16].try_into().unwrap());
    let mpp_y = f64::from_le_bytes(meta.payload[16..24].try_into().unwrap());
    let mpp_is_default = u32::from_le_bytes(meta.payload[24..28].try_into().unwrap()) != 0;

    let mut accumulators: Vec<LevelAccumulator> = Vec::new();
    accumulators.resize_with(level_count, LevelAccumulator::default);

    loop {
        let block = cursor.next_block()?;
        match block.block_type {
            BLOCK_TERMINATOR => break,
            BLOCK_TIFF_IFDS => {
                let acc = level_slot(&mut accumulators, block.index)?;
                if block.payload.len() < IFD_RECORD_SIZE {
                    return Err(TiffError::BadMetadataStream(
                        "short IFD record".to_string(),
                    ));
                }
                let mut record = [0u8; IFD_RECORD_SIZE];
                record.copy_from_slice(&block.payload[..IFD_RECORD_SIZE]);
                acc.record = Some(record);
            }
            BLOCK_TIFF_TILE_OFFSETS => {
                let acc = level_slot(&mut accumulators, block.index)?;
                acc.tile_offsets = parse_u64_payload(block.payload);
            }
            BLOCK_TIFF_TILE_BYTE_COUNTS => {
                let acc = level_slot(&mut accumulators, block.index)?;
                acc.tile_byte_counts = parse_u64_payload(block.payload);
            }
            BLOCK_TIFF_JPEG_TABLES => {
                let acc = level_slot(&mut accumulators, block.index)?;
                acc.jpeg_tables = Some(Bytes::copy_from_slice(block.payload));
            }
            BLOCK_TIFF_IMAGE_DESCRIPTION => {
                // Carried for completeness; not needed to rebuild the pyramid
            }
            other => {
                return Err(TiffError::BadMetadataStream(format!(
                    "unknown block type {other}"
                )));
            }
        }
    }

    let mut levels = Vec::with_capacity(level_count);
    for (i, acc) in accumulators.into_iter().enumerate() {
        let record = acc.record.ok_or_else(|| {
            TiffError::BadMetadataStream(format!("missing IFD record for level slot {i}"))
        })?;

        let photometric_code = u16::from_le_bytes(record[28..30].try_into().unwrap());
        let photometric = Photometric::from_u16(photometric_code)
            .ok_or(TiffError::UnsupportedPhotometric(photometric_code))?;

        levels.push(TiffLevel {
            level: u32::from_le_bytes(record[0..4].try_into().unwrap()),
            ifd_index: i,
            width: u32::from_le_bytes(record[4..8].try_into().unwrap()),
            height: u32::from_le_bytes(record[8..12].try_into().unwrap()),
            tile_width: u32::from_le_bytes(record[12..16].try_into().unwrap()),
            tile_height: u32::from_le_bytes(record[16..20].try_into().unwrap()),
            tiles_x: u32::from_le_bytes(record[20..24].try_into().unwrap()),
            tiles_y: u32::from_le_bytes(record[24..28].try_into().unwrap()),
            photometric,
            tile_offsets: acc.tile_offsets,
            tile_byte_counts: acc.tile_byte_counts,
            jpeg_tables: acc.jpeg_tables,
        });
    }

    Ok(TiffSlide::from_parts(
        TiffHeader {
            byte_order,
            is_bigtiff,
            first_ifd_offset: 0,
        },
        levels,
        mpp_x,
        mpp_y,
        mpp_is_default,
    ))
}

fn level_slot(
    accumulators: &mut [LevelAccumulator],
    index: u32,
) -> Result<&mut LevelAccumulator, TiffError> {
    accumulators.get_mut(index as usize).ok_or_else(|| {
        TiffError::BadMetadataStream(format!("block references level slot {index} out of range"))
    })
}

fn parse_u64_payload(payload: &[u8]) -> Vec<u64> {
    payload
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slide() -> TiffSlide {
        let levels = vec![
            TiffLevel {
                level: 0,
                ifd_index: 0,
                width: 100_000,
                height: 60_000,
                tile_width: 512,
                tile_height: 512,
                tiles_x: 196,
                tiles_y: 118,
                photometric: Photometric::YCbCr,
                tile_offsets: (0..10u64).map(|i| 4096 + i * 20_000).collect(),
                tile_byte_counts: vec![20_000; 10],
                jpeg_tables: Some(Bytes::from(vec![0xFF, 0xD8, 0xFF, 0xDB, 0xFF, 0xD9])),
            },
            TiffLevel {
                level: 2,
                ifd_index: 1,
                width: 25_000,
                height: 15_000,
                tile_width: 512,
                tile_height: 512,
                tiles_x: 49,
                tiles_y: 30,
                photometric: Photometric::Rgb,
                tile_offsets: vec![1_000_000, 1_020_000],
                tile_byte_counts: vec![20_000, 0],
                jpeg_tables: None,
            },
        ];

        TiffSlide::from_parts(
            TiffHeader {
                byte_order: ByteOrder::LittleEndian,
                is_bigtiff: true,
                first_ifd_offset: 16,
            },
            levels,
            0.25,
            0.25,
            false,
        )
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let slide = make_slide();
        let stream = serialize_metadata(&slide);
        let parsed = parse_metadata(&stream).unwrap();

        assert_eq!(parsed.header.is_bigtiff, slide.header.is_bigtiff);
        assert_eq!(parsed.levels.len(), slide.levels.len());
        assert_eq!(parsed.mpp_x, slide.mpp_x);
        assert_eq!(parsed.level_count(), slide.level_count());

        for (a, b) in parsed.levels.iter().zip(slide.levels.iter()) {
            assert_eq!(a.level, b.level);
            assert_eq!(a.width, b.width);
            assert_eq!(a.height, b.height);
            assert_eq!(a.tile_offsets, b.tile_offsets);
            assert_eq!(a.tile_byte_counts, b.tile_byte_counts);
            assert_eq!(a.jpeg_tables, b.jpeg_tables);
        }
    }

    #[test]
    fn test_round_trip_compressed() {
        let slide = make_slide();
        let stream = serialize_metadata_compressed(&slide);

        // Outer block must be the LZ4 wrapper
        assert_eq!(
            u32::from_le_bytes(stream[0..4].try_into().unwrap()),
            BLOCK_LZ4_COMPRESSED_DATA
        );

        let parsed = parse_metadata(&stream).unwrap();
        assert_eq!(parsed.levels.len(), 2);
        assert_eq!(parsed.levels[0].tile_offsets, slide.levels[0].tile_offsets);
    }

    #[test]
    fn test_truncated_stream() {
        let slide = make_slide();
        let stream = serialize_metadata(&slide);
        let result = parse_metadata(&stream[..stream.len() / 2]);
        assert!(matches!(result, Err(TiffError::BadMetadataStream(_))));
    }

    #[test]
    fn test_unknown_block_type_rejected() {
        let mut stream = Vec::new();
        push_block_header(&mut stream, BLOCK_TIFF_HEADER_AND_META, 0, 32);
        stream.extend_from_slice(&[0u8; 32]);
        push_block_header(&mut stream, 1234, 0, 0);
        let result = parse_metadata(&stream);
        assert!(matches!(result, Err(TiffError::BadMetadataStream(_))));
    }

    #[test]
    fn test_missing_terminator() {
        let mut stream = Vec::new();
        push_block_header(&mut stream, BLOCK_TIFF_HEADER_AND_META, 0, 32);
        stream.extend_from_slice(&[0u8; 32]);
        let result = parse_metadata(&stream);
        assert!(matches!(result, Err(TiffError::BadMetadataStream(_))));
    }
}
