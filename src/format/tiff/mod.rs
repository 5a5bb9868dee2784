//! TIFF parser for Whole Slide Images.
//!
//! This module handles parsing of TIFF and BigTIFF pyramids of
//! JPEG-compressed tiles as produced by common WSI scanners.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian,
//!   MM = big-endian) in the header. All multi-byte values must be read
//!   respecting this order.
//!
//! - **Classic TIFF vs BigTIFF**: Classic TIFF uses 32-bit offsets (max 4GB
//!   files), while BigTIFF uses 64-bit offsets. The parser handles both.
//!
//! - **IFD (Image File Directory)**: Contains metadata and pointers to image
//!   data. WSI files have multiple IFDs for pyramid levels, labels, macros.
//!
//! - **Level classification**: IFDs are classified into discrete pyramid
//!   levels (2^l downsample), macro and label images; see [`TiffSlide`].
//!
//! - **Wire metadata**: the parsed pyramid serialises into a typed-block
//!   stream for the remote protocol; see [`serialize_metadata`].

mod parser;
mod pyramid;
mod tags;
mod values;
mod wire;

pub use parser::{
    ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE,
};
pub use pyramid::{
    deduce_downsample_level, IfdKind, TiffLevel, TiffSlide, DEFAULT_MPP_NO_RESOLUTION,
    MAX_LEVEL_COUNT,
};
pub use tags::{Compression, FieldType, Photometric, TiffTag};
pub use values::{parse_u32_array, parse_u64_array, ValueReader};
pub use wire::{
    parse_metadata, serialize_metadata, serialize_metadata_compressed, BLOCK_HEADER_SIZE,
    BLOCK_LZ4_COMPRESSED_DATA, BLOCK_TERMINATOR, BLOCK_TIFF_HEADER_AND_META, BLOCK_TIFF_IFDS,
    BLOCK_TIFF_IMAGE_DESCRIPTION, BLOCK_TIFF_JPEG_TABLES, BLOCK_TIFF_TILE_BYTE_COUNTS,
    BLOCK_TIFF_TILE_OFFSETS,
};
